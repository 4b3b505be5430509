//! Timestamp extraction.
//!
//! The align and locate engines never compute word times themselves; they
//! hand a mel window plus the words to time to a [`TimestampExtractor`].
//! [`AttentionAligner`] is the default implementation; tests substitute
//! scripted extractors.

pub mod attention;
pub mod dtw;

pub use dtw::AttentionAligner;

use ndarray::ArrayView2;

use crate::error::Result;
use crate::inference::SequenceModel;
use crate::text::{TextTokenizer, WordTokens};
use crate::transcript::Word;

/// One extraction call.
#[derive(Debug, Clone, Copy)]
pub struct ExtractRequest<'a> {
    /// `[n_mels, n_frames]` features, padded or trimmed to one chunk.
    pub mel: ArrayView2<'a, f32>,
    /// Words to time, in order.
    pub words: &'a [WordTokens],
    /// Audible samples behind `mel`; frames past them are padding.
    pub num_samples: usize,
    /// Absolute time of the first frame, in seconds.
    pub time_offset: f64,
    pub language: &'a str,
}

impl ExtractRequest<'_> {
    pub fn token_count(&self) -> usize {
        self.words.iter().map(|w| w.tokens.len()).sum()
    }
}

/// Contract for timestamp extraction adapters.
///
/// Returns the words in order with absolute times. A word the window could
/// not place comes back with zero duration; callers treat trailing ones as
/// unresolved and retry them with more context.
pub trait TimestampExtractor: Send {
    fn extract(
        &mut self,
        model: &mut dyn SequenceModel,
        tokenizer: &dyn TextTokenizer,
        request: &ExtractRequest<'_>,
    ) -> Result<Vec<Word>>;
}
