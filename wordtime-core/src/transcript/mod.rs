//! Timed words, segments and the transcript container the engines read and
//! write.
//!
//! All times are absolute seconds from the start of the audio, rounded to
//! milliseconds when produced by an engine.

use serde::{Deserialize, Serialize};

/// Round seconds to millisecond resolution.
pub fn round_ms(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

// ---------------------------------------------------------------------------
// Word
// ---------------------------------------------------------------------------

/// A single timed word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Word {
    /// Display text, including any leading space the tokenizer produced.
    pub text: String,
    /// Token ids making up `text`. Never rewritten once the word exists.
    #[serde(default)]
    pub tokens: Vec<u32>,
    pub start: f64,
    pub end: f64,
    /// Mean token probability in `[0, 1]`.
    pub probability: f32,
    /// Index of the owning segment within its transcript.
    #[serde(default)]
    pub segment_id: usize,
}

impl Word {
    pub fn new(text: impl Into<String>, tokens: Vec<u32>, start: f64, end: f64) -> Self {
        Self {
            text: text.into(),
            tokens,
            start,
            end,
            probability: 1.0,
            segment_id: 0,
        }
    }

    pub fn with_probability(mut self, probability: f32) -> Self {
        self.probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// `true` when the word has not been given a real span.
    pub fn is_instant(&self) -> bool {
        self.duration() <= 0.0
    }
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: usize,
    pub words: Vec<Word>,
}

impl Segment {
    pub fn new(id: usize, mut words: Vec<Word>) -> Self {
        for w in &mut words {
            w.segment_id = id;
        }
        Self { id, words }
    }

    pub fn start(&self) -> Option<f64> {
        self.words.first().map(|w| w.start)
    }

    pub fn end(&self) -> Option<f64> {
        self.words.last().map(|w| w.end)
    }

    pub fn text(&self) -> String {
        self.words.iter().map(|w| w.text.as_str()).collect()
    }

    pub fn is_first_word(&self, idx: usize) -> bool {
        idx == 0
    }

    pub fn is_last_word(&self, idx: usize) -> bool {
        idx + 1 == self.words.len()
    }
}

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    #[serde(default)]
    pub language: Option<String>,
    pub segments: Vec<Segment>,
}

impl Transcript {
    /// Build a transcript from words, cutting a new segment after each index
    /// in `split_after` (exclusive end positions, ascending).
    pub fn from_words(language: Option<String>, words: Vec<Word>, split_after: &[usize]) -> Self {
        let mut segments = Vec::new();
        let mut current = Vec::new();
        let mut cuts = split_after.iter().copied().peekable();
        for (i, word) in words.into_iter().enumerate() {
            current.push(word);
            while let Some(&cut) = cuts.peek() {
                if cut > i + 1 {
                    break;
                }
                cuts.next();
                if cut == i + 1 && !current.is_empty() {
                    segments.push(Segment::new(segments.len(), std::mem::take(&mut current)));
                }
            }
        }
        if !current.is_empty() {
            segments.push(Segment::new(segments.len(), current));
        }
        Self { language, segments }
    }

    /// `true` when at least one segment holds words and every segment does.
    pub fn has_words(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(|s| !s.words.is_empty())
    }

    pub fn words(&self) -> impl Iterator<Item = &Word> {
        self.segments.iter().flat_map(|s| s.words.iter())
    }

    pub fn words_mut(&mut self) -> impl Iterator<Item = &mut Word> {
        self.segments.iter_mut().flat_map(|s| s.words.iter_mut())
    }

    pub fn word_count(&self) -> usize {
        self.segments.iter().map(|s| s.words.len()).sum()
    }

    pub fn text(&self) -> String {
        self.segments.iter().map(Segment::text).collect()
    }

    /// Per-word `(is_first_in_segment, is_last_in_segment)` flags in word order.
    pub fn edge_flags(&self) -> Vec<(bool, bool)> {
        self.segments
            .iter()
            .flat_map(|s| (0..s.words.len()).map(move |i| (s.is_first_word(i), s.is_last_word(i))))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Locate results
// ---------------------------------------------------------------------------

/// Word of a decoded confirmation window, without timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowWord {
    pub text: String,
    pub tokens: Vec<u32>,
    pub probability: f32,
}

/// One located occurrence of the target phrase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LocateMatch {
    /// Attention-peak estimate only.
    Unconfirmed { end: f64 },
    /// Estimate confirmed by constrained decoding.
    #[serde(rename_all = "camelCase")]
    Confirmed {
        end: f64,
        text: String,
        window_text: String,
        window_words: Vec<WindowWord>,
    },
    /// Confirmed and word-timed by the extraction adapter.
    Transcribed { segment: Segment },
}

impl LocateMatch {
    /// Best available end time of the located phrase.
    pub fn end(&self) -> Option<f64> {
        match self {
            LocateMatch::Unconfirmed { end } | LocateMatch::Confirmed { end, .. } => Some(*end),
            LocateMatch::Transcribed { segment } => segment.end(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, start: f64, end: f64) -> Word {
        Word::new(text, vec![], start, end)
    }

    #[test]
    fn from_words_splits_and_numbers_segments() {
        let words = vec![
            word(" a", 0.0, 0.5),
            word(" b", 0.5, 1.0),
            word(" c", 1.0, 1.5),
        ];
        let t = Transcript::from_words(Some("en".into()), words, &[2]);
        assert_eq!(t.segments.len(), 2);
        assert_eq!(t.segments[0].words.len(), 2);
        assert_eq!(t.segments[1].words[0].segment_id, 1);
        assert_eq!(t.text(), " a b c");
    }

    #[test]
    fn edge_flags_mark_segment_boundaries() {
        let words = vec![
            word(" a", 0.0, 0.5),
            word(" b", 0.5, 1.0),
            word(" c", 1.0, 1.5),
        ];
        let t = Transcript::from_words(None, words, &[1]);
        assert_eq!(
            t.edge_flags(),
            vec![(true, true), (true, false), (false, true)]
        );
    }

    #[test]
    fn locate_match_serializes_with_kind_tag() {
        let m = LocateMatch::Unconfirmed { end: 2.4 };
        let json = serde_json::to_value(&m).expect("serialize");
        assert_eq!(json["kind"], "unconfirmed");
        assert_eq!(json["end"], 2.4);
    }

    #[test]
    fn round_ms_rounds_to_millis() {
        assert_eq!(round_ms(1.23456), 1.235);
        assert_eq!(round_ms(0.0004), 0.0);
    }
}
