//! Tokenizer collaborator and word-level grouping of token sequences.
//!
//! The engines never look inside a tokenizer; they encode text, decode token
//! runs back to text, and need the handful of special ids that frame a
//! Whisper prompt. Grouping tokens into words happens here, on top of that
//! contract, so every backend splits words the same way.

pub mod stub;

#[cfg(feature = "onnx")]
pub mod hf;

#[cfg(feature = "onnx")]
pub use hf::WhisperTokenizer;

use crate::error::{Result, WordtimeError};
use crate::transcript::Word;

/// Contract for text tokenizers.
pub trait TextTokenizer: Send {
    /// Encode plain text without special tokens.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode tokens, dropping special tokens.
    fn decode(&self, tokens: &[u32]) -> Result<String>;

    /// End-of-text id; every id below it is an ordinary text token.
    fn eot(&self) -> u32;

    /// `<|startoftranscript|>`, the language token and the task token.
    fn sot_sequence(&self, language: &str) -> Result<Vec<u32>>;

    /// `<|notimestamps|>`.
    fn no_timestamps(&self) -> u32;

    /// `<|startofprev|>`, if the vocabulary has one.
    fn sot_prev(&self) -> Option<u32> {
        None
    }
}

/// A word and the tokens that spell it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordTokens {
    pub text: String,
    pub tokens: Vec<u32>,
}

const PUNCTUATION: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// Languages written without spaces between words.
pub fn is_space_delimited(language: &str) -> bool {
    !matches!(language, "zh" | "ja" | "th" | "lo" | "my" | "yue")
}

const LANGUAGE_NAMES: &[(&str, &str)] = &[
    ("english", "en"),
    ("chinese", "zh"),
    ("mandarin", "zh"),
    ("german", "de"),
    ("spanish", "es"),
    ("russian", "ru"),
    ("korean", "ko"),
    ("french", "fr"),
    ("japanese", "ja"),
    ("portuguese", "pt"),
    ("turkish", "tr"),
    ("polish", "pl"),
    ("catalan", "ca"),
    ("dutch", "nl"),
    ("arabic", "ar"),
    ("swedish", "sv"),
    ("italian", "it"),
    ("indonesian", "id"),
    ("hindi", "hi"),
    ("finnish", "fi"),
    ("vietnamese", "vi"),
    ("hebrew", "he"),
    ("ukrainian", "uk"),
    ("greek", "el"),
    ("czech", "cs"),
    ("thai", "th"),
    ("cantonese", "yue"),
];

/// Normalize a language name or code to a lowercase Whisper code.
pub fn normalize_language(language: &str) -> Result<String> {
    let lang = language.trim().to_ascii_lowercase();
    if lang.is_empty() {
        return Err(WordtimeError::MissingLanguage);
    }
    if let Some((_, code)) = LANGUAGE_NAMES.iter().find(|(name, _)| *name == lang) {
        return Ok((*code).to_string());
    }
    if (2..=3).contains(&lang.len()) && lang.chars().all(|c| c.is_ascii_alphabetic()) {
        return Ok(lang);
    }
    Err(WordtimeError::UnsupportedLanguage(language.to_string()))
}

/// Group tokens into decodable units, never splitting a multi-byte
/// character across two units.
fn split_on_unicode(tokens: &[u32], tokenizer: &dyn TextTokenizer) -> Result<Vec<WordTokens>> {
    let mut units = Vec::new();
    let mut current: Vec<u32> = Vec::new();
    for &token in tokens {
        current.push(token);
        let decoded = tokenizer.decode(&current)?;
        if !decoded.contains('\u{FFFD}') {
            units.push(WordTokens {
                text: decoded,
                tokens: std::mem::take(&mut current),
            });
        }
    }
    if !current.is_empty() {
        units.push(WordTokens {
            text: tokenizer.decode(&current)?,
            tokens: current,
        });
    }
    Ok(units)
}

/// Split a token sequence into words.
///
/// A word starts at a unit beginning with a space, at a punctuation unit,
/// and at any special token (id >= end-of-text). Languages without spaces
/// get one word per decodable unit.
pub fn split_word_tokens(
    tokens: &[u32],
    tokenizer: &dyn TextTokenizer,
    space_delimited: bool,
) -> Result<Vec<WordTokens>> {
    let units = split_on_unicode(tokens, tokenizer)?;
    if !space_delimited {
        return Ok(units);
    }

    let eot = tokenizer.eot();
    let mut words: Vec<WordTokens> = Vec::new();
    for unit in units {
        let special = unit.tokens.first().is_some_and(|&t| t >= eot);
        let with_space = unit.text.starts_with(' ');
        let trimmed = unit.text.trim();
        let punctuation = !trimmed.is_empty() && trimmed.chars().all(|c| PUNCTUATION.contains(c));
        match words.last_mut() {
            Some(last) if !(special || with_space || punctuation) => {
                last.text.push_str(&unit.text);
                last.tokens.extend(unit.tokens);
            }
            _ => words.push(unit),
        }
    }
    Ok(words)
}

/// Punctuation that attaches to the following / preceding word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunctuationRules {
    pub prepend: String,
    pub append: String,
}

impl Default for PunctuationRules {
    fn default() -> Self {
        Self {
            prepend: "\"'“¿([{-".into(),
            append: "\"'.。,，!！?？:：”)]}、".into(),
        }
    }
}

impl PunctuationRules {
    /// Fold standalone punctuation words into their neighbours. Merged words
    /// keep the receiving word's timing and probability.
    pub fn merge(&self, words: Vec<Word>) -> Vec<Word> {
        if words.len() < 2 {
            return words;
        }
        let mut words = words;

        // Prepended: scan backwards so runs like `"(` collapse into the word.
        let mut j = words.len() - 1;
        for i in (0..words.len() - 1).rev() {
            let prev = &words[i];
            let stripped = prev.text.trim();
            if prev.text.starts_with(' ') && !stripped.is_empty() && self.prepend.contains(stripped)
            {
                let text = std::mem::take(&mut words[i].text);
                let mut tokens = std::mem::take(&mut words[i].tokens);
                let following = &mut words[j];
                following.text = text + &following.text;
                tokens.append(&mut following.tokens);
                following.tokens = tokens;
            } else {
                j = i;
            }
        }

        // Appended: scan forwards.
        let mut i = 0;
        for j in 1..words.len() {
            let following = &words[j].text;
            if following.is_empty() {
                continue;
            }
            if !words[i].text.ends_with(' ') && self.append.contains(following.as_str()) {
                let text = std::mem::take(&mut words[j].text);
                let tokens = std::mem::take(&mut words[j].tokens);
                words[i].text.push_str(&text);
                words[i].tokens.extend(tokens);
            } else {
                i = j;
            }
        }

        words.retain(|w| !w.text.is_empty());
        words
    }
}

#[cfg(test)]
mod tests {
    use super::stub::VocabTokenizer;
    use super::*;

    #[test]
    fn words_split_on_leading_space_and_punctuation() {
        let tok = VocabTokenizer::new(["hello", "world", "wide", ","]);
        let tokens = tok.encode(" hello, world").unwrap();
        let words = split_word_tokens(&tokens, &tok, true).unwrap();
        let texts: Vec<_> = words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec![" hello", ",", " world"]);
    }

    #[test]
    fn subword_continuations_join_the_previous_word() {
        let tok = VocabTokenizer::new(["wide"]).with_suffixes(["ly"]);
        let tokens = tok.encode(" widely").unwrap();
        assert_eq!(tokens.len(), 2);
        let words = split_word_tokens(&tokens, &tok, true).unwrap();
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].text, " widely");
        assert_eq!(words[0].tokens, tokens);
    }

    #[test]
    fn special_tokens_become_their_own_word() {
        let tok = VocabTokenizer::new(["done"]);
        let mut tokens = tok.encode(" done").unwrap();
        tokens.push(tok.eot());
        let words = split_word_tokens(&tokens, &tok, true).unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[1].tokens, vec![tok.eot()]);
    }

    #[test]
    fn unspaced_languages_split_per_unit() {
        let tok = VocabTokenizer::new(["wide"]).with_suffixes(["ly"]);
        let tokens = tok.encode(" widely").unwrap();
        let words = split_word_tokens(&tokens, &tok, false).unwrap();
        assert_eq!(words.len(), 2);
    }

    #[test]
    fn punctuation_merges_into_neighbours() {
        let w = |t: &str, s: f64| Word::new(t, vec![s as u32], s, s + 0.5);
        let words = vec![w(" (", 0.0), w(" hi", 1.0), w(")", 2.0), w(" there", 3.0), w(".", 4.0)];
        let merged = PunctuationRules::default().merge(words);
        let texts: Vec<_> = merged.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec![" ( hi)", " there."]);
        assert_eq!(merged[0].tokens, vec![0, 1, 2]);
        assert_eq!(merged[0].start, 1.0);
    }

    #[test]
    fn language_names_and_codes_normalize() {
        assert_eq!(normalize_language("English").unwrap(), "en");
        assert_eq!(normalize_language(" DE ").unwrap(), "de");
        assert!(matches!(
            normalize_language(""),
            Err(WordtimeError::MissingLanguage)
        ));
        assert!(normalize_language("klingon-ish").is_err());
        assert!(!is_space_delimited("ja"));
        assert!(is_space_delimited("en"));
    }
}
