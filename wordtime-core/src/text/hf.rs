//! Whisper tokenizer over a HuggingFace `tokenizer.json`.

use std::path::Path;

use tokenizers::Tokenizer;

use crate::error::{Result, WordtimeError};
use crate::text::TextTokenizer;

fn tok_err(e: impl std::fmt::Display) -> WordtimeError {
    WordtimeError::Tokenizer(e.to_string())
}

pub struct WhisperTokenizer {
    inner: Tokenizer,
    eot: u32,
    sot: u32,
    transcribe: u32,
    no_timestamps: u32,
    sot_prev: Option<u32>,
}

impl WhisperTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(WordtimeError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::new(Tokenizer::from_file(path).map_err(tok_err)?)
    }

    pub fn new(inner: Tokenizer) -> Result<Self> {
        let special = |token: &str| {
            inner
                .token_to_id(token)
                .ok_or_else(|| WordtimeError::Tokenizer(format!("vocabulary has no {token}")))
        };
        Ok(Self {
            eot: special("<|endoftext|>")?,
            sot: special("<|startoftranscript|>")?,
            transcribe: special("<|transcribe|>")?,
            no_timestamps: special("<|notimestamps|>")?,
            sot_prev: inner.token_to_id("<|startofprev|>"),
            inner,
        })
    }

    /// Id of `<|xx|>` for a normalized language code.
    pub fn language_token(&self, language: &str) -> Result<u32> {
        self.inner
            .token_to_id(&format!("<|{language}|>"))
            .ok_or_else(|| WordtimeError::UnsupportedLanguage(language.to_string()))
    }
}

impl TextTokenizer for WhisperTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, false).map_err(tok_err)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let text: Vec<u32> = tokens.iter().copied().filter(|&t| t < self.eot).collect();
        self.inner.decode(&text, false).map_err(tok_err)
    }

    fn eot(&self) -> u32 {
        self.eot
    }

    fn sot_sequence(&self, language: &str) -> Result<Vec<u32>> {
        Ok(vec![self.sot, self.language_token(language)?, self.transcribe])
    }

    fn no_timestamps(&self) -> u32 {
        self.no_timestamps
    }

    fn sot_prev(&self) -> Option<u32> {
        self.sot_prev
    }
}

impl std::fmt::Debug for WhisperTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperTokenizer")
            .field("eot", &self.eot)
            .field("vocab", &self.inner.get_vocab_size(true))
            .finish()
    }
}
