//! `VocabTokenizer`: closed-vocabulary tokenizer with Whisper-style ids.
//!
//! Pairs with [`crate::inference::stub::ScriptedModel`] so the engines can be
//! exercised end-to-end without model files. Words encode as one token each
//! with a leading space; suffixes continue the previous word without one;
//! punctuation exists in both forms.

use crate::error::{Result, WordtimeError};
use crate::text::TextTokenizer;

pub const EOT: u32 = 1000;
pub const SOT: u32 = 1001;
pub const SOT_PREV: u32 = 1002;
pub const LANGUAGE: u32 = 1003;
pub const TRANSCRIBE: u32 = 1004;
pub const NO_TIMESTAMPS: u32 = 1005;
pub const VOCAB_SIZE: usize = 1006;

#[derive(Debug, Clone)]
pub struct VocabTokenizer {
    /// Token text by id; ids below [`EOT`].
    pieces: Vec<String>,
}

impl VocabTokenizer {
    /// Words become ` word` tokens; punctuation entries get a spaced and an
    /// unspaced token.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pieces = Vec::new();
        for entry in entries {
            let entry = entry.as_ref();
            if entry.chars().all(|c| c.is_ascii_punctuation()) {
                pieces.push(entry.to_string());
            }
            pieces.push(format!(" {entry}"));
        }
        Self { pieces }
    }

    /// Add pieces that continue a word without a space.
    pub fn with_suffixes<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.pieces
            .extend(suffixes.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    /// Id of an exact piece, e.g. `" hello"`.
    pub fn id_of(&self, piece: &str) -> Option<u32> {
        self.pieces.iter().position(|p| p == piece).map(|i| i as u32)
    }

    fn longest_match(&self, rest: &str, word_start: bool) -> Option<(u32, usize)> {
        self.pieces
            .iter()
            .enumerate()
            .filter_map(|(id, piece)| {
                let body = if word_start {
                    piece.strip_prefix(' ')?
                } else if piece.starts_with(' ') {
                    return None;
                } else {
                    piece.as_str()
                };
                (!body.is_empty() && rest.starts_with(body)).then_some((id as u32, body.len()))
            })
            .max_by_key(|&(_, len)| len)
    }
}

impl TextTokenizer for VocabTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut tokens = Vec::new();
        for chunk in text.split_whitespace() {
            let mut rest = chunk;
            let mut word_start = true;
            while !rest.is_empty() {
                let (id, len) = self.longest_match(rest, word_start).ok_or_else(|| {
                    WordtimeError::Tokenizer(format!("no vocabulary entry for {rest:?}"))
                })?;
                tokens.push(id);
                rest = &rest[len..];
                word_start = false;
            }
        }
        Ok(tokens)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let mut text = String::new();
        for &t in tokens.iter().filter(|&&t| t < EOT) {
            let piece = self
                .pieces
                .get(t as usize)
                .ok_or_else(|| WordtimeError::Tokenizer(format!("unknown token id {t}")))?;
            text.push_str(piece);
        }
        Ok(text)
    }

    fn eot(&self) -> u32 {
        EOT
    }

    fn sot_sequence(&self, language: &str) -> Result<Vec<u32>> {
        if language.trim().is_empty() {
            return Err(WordtimeError::MissingLanguage);
        }
        Ok(vec![SOT, LANGUAGE, TRANSCRIBE])
    }

    fn no_timestamps(&self) -> u32 {
        NO_TIMESTAMPS
    }

    fn sot_prev(&self) -> Option<u32> {
        Some(SOT_PREV)
    }
}
