//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;

use wordtime_core::{
    inference::SequenceModel,
    text::TextTokenizer,
    timing::{ExtractRequest, TimestampExtractor},
    Result, Word,
};

/// One extraction call as seen by [`ScriptedExtractor`].
#[derive(Debug, Clone, PartialEq)]
pub struct SeenRequest {
    pub time_offset: f64,
    pub window_secs: f64,
    pub words: Vec<String>,
    pub tokens: usize,
}

/// Extractor that knows the true time of every word.
///
/// A word whose true span ends inside the request window is returned at its
/// true time; any other word comes back with zero duration at the window
/// end, which the engines treat as unresolved.
#[derive(Debug, Default)]
pub struct ScriptedExtractor {
    truth: HashMap<String, (f64, f64)>,
    pub seen: Vec<SeenRequest>,
}

impl ScriptedExtractor {
    pub fn new<'a>(truth: impl IntoIterator<Item = (&'a str, f64, f64)>) -> Self {
        Self {
            truth: truth
                .into_iter()
                .map(|(w, s, e)| (w.trim().to_string(), (s, e)))
                .collect(),
            seen: Vec::new(),
        }
    }
}

impl TimestampExtractor for ScriptedExtractor {
    fn extract(
        &mut self,
        model: &mut dyn SequenceModel,
        _tokenizer: &dyn TextTokenizer,
        request: &ExtractRequest<'_>,
    ) -> Result<Vec<Word>> {
        let sr = model.dims().sample_rate as f64;
        let window_secs = request.num_samples as f64 / sr;
        let window_end = request.time_offset + window_secs;
        self.seen.push(SeenRequest {
            time_offset: request.time_offset,
            window_secs,
            words: request.words.iter().map(|w| w.text.clone()).collect(),
            tokens: request.token_count(),
        });
        Ok(request
            .words
            .iter()
            .map(|w| match self.truth.get(w.text.trim()) {
                Some(&(start, end)) if start >= request.time_offset && end <= window_end => {
                    Word::new(w.text.clone(), w.tokens.clone(), start, end).with_probability(0.9)
                }
                _ => Word::new(w.text.clone(), w.tokens.clone(), window_end, window_end)
                    .with_probability(0.0),
            })
            .collect())
    }
}

pub fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol
}
