//! Caller-facing options for the three engines.
//!
//! Every struct deserializes from camelCase JSON with missing fields taking
//! their defaults, so an options file only needs the values it overrides.
//! `validate()` runs before any inference call.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WordtimeError};

// ---------------------------------------------------------------------------
// Align
// ---------------------------------------------------------------------------

/// Options for [`crate::align::align`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlignOptions {
    /// Language code. Falls back to the input transcript's language.
    /// Default: none.
    pub language: Option<String>,
    /// Token budget per extraction request. `0` selects the model maximum.
    /// Default: 100.
    pub token_step: usize,
    /// Drop words still unresolved when the audio runs out instead of
    /// stamping them at the total duration with probability 0.
    /// Default: false.
    pub remove_instant_words: bool,
    /// Regroup aligned words following the input's line breaks or segments.
    /// Default: false.
    pub original_split: bool,
    /// Log each resolved word at `info` instead of `debug`. Default: false.
    pub verbose: bool,
}

impl Default for AlignOptions {
    fn default() -> Self {
        Self {
            language: None,
            token_step: 100,
            remove_instant_words: false,
            original_split: false,
            verbose: false,
        }
    }
}

impl AlignOptions {
    /// Resolve the effective token budget against the model maximum.
    pub fn effective_token_step(&self, max_token_step: usize) -> Result<usize> {
        match self.token_step {
            0 => Ok(max_token_step),
            step if step > max_token_step => Err(WordtimeError::TokenStepTooLarge {
                requested: step,
                max: max_token_step,
            }),
            step => Ok(step),
        }
    }
}

// ---------------------------------------------------------------------------
// Refine
// ---------------------------------------------------------------------------

/// Which word boundary a refinement pass moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Start,
    End,
}

/// Options for [`crate::refine::refine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RefineOptions {
    /// Pass order: `s` refines starts, `e` refines ends. Default: `"se"`.
    pub steps: String,
    /// Target precision in seconds. Default: 0.1.
    pub precision: f64,
    /// Max relative probability drop from baseline. Default: 0.03.
    pub rel_prob_decrease: f32,
    /// Max absolute probability drop from baseline. Default: 0.05.
    pub abs_prob_decrease: f32,
    /// Max relative drop from the previous iteration. Default: none.
    pub rel_rel_prob_decrease: Option<f32>,
    /// Minimum probability a probe may reach. Default: 0.5.
    pub prob_threshold: f32,
    /// Max change as a fraction of the word's duration. Default: 0.5.
    pub rel_dur_change: Option<f64>,
    /// Max change in seconds. Default: none.
    pub abs_dur_change: Option<f64>,
    /// Refine every word; `false` only moves segment-edge words.
    /// Default: true.
    pub word_level: bool,
    /// Probe each masked variant in its own forward call. Default: false.
    pub single_batch: bool,
    /// Log each finished word at `info` instead of `debug`. Default: false.
    pub verbose: bool,
}

impl Default for RefineOptions {
    fn default() -> Self {
        Self {
            steps: "se".into(),
            precision: 0.1,
            rel_prob_decrease: 0.03,
            abs_prob_decrease: 0.05,
            rel_rel_prob_decrease: None,
            prob_threshold: 0.5,
            rel_dur_change: Some(0.5),
            abs_dur_change: None,
            word_level: true,
            single_batch: false,
            verbose: false,
        }
    }
}

impl RefineOptions {
    /// Parse `steps` into passes, rejecting any letter other than `s`/`e`.
    /// An empty string means `"se"`.
    pub fn passes(&self) -> Result<Vec<Endpoint>> {
        let steps = if self.steps.is_empty() {
            "se"
        } else {
            self.steps.as_str()
        };
        let invalid: String = steps.chars().filter(|c| !matches!(c, 's' | 'e')).collect();
        if !invalid.is_empty() {
            return Err(WordtimeError::InvalidSteps { steps: invalid });
        }
        Ok(steps
            .chars()
            .map(|c| if c == 's' { Endpoint::Start } else { Endpoint::End })
            .collect())
    }

    /// Bisection stop width in frames, never below two.
    pub fn frame_precision(&self, frames_per_second: f64) -> usize {
        ((self.precision * frames_per_second).round().max(0.0) as usize).max(2)
    }

    pub fn validate(&self) -> Result<()> {
        self.passes()?;
        if !(self.precision.is_finite() && self.precision >= 0.0) {
            return Err(WordtimeError::InvalidOption(format!(
                "precision must be a non-negative number, got {}",
                self.precision
            )));
        }
        if !(0.0..=1.0).contains(&self.prob_threshold) {
            return Err(WordtimeError::InvalidOption(format!(
                "prob_threshold must lie in [0, 1], got {}",
                self.prob_threshold
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Locate
// ---------------------------------------------------------------------------

/// How far `locate` takes each candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LocateMode {
    /// Confirm, then time every word of the decoded window.
    #[default]
    Transcribe,
    /// Confirm by decoding, report the decoded window text.
    Confirm,
    /// Attention-peak estimate only. Every window yields an estimate, so a
    /// window without the phrase can repeat an earlier end time.
    CoarseOnly,
}

/// Seconds of audio around a coarse estimate to decode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationWindow {
    Symmetric(f64),
    Asymmetric { before: f64, after: f64 },
}

impl DurationWindow {
    pub fn before(&self) -> f64 {
        match *self {
            DurationWindow::Symmetric(v) => v,
            DurationWindow::Asymmetric { before, .. } => before,
        }
    }

    pub fn after(&self) -> f64 {
        match *self {
            DurationWindow::Symmetric(v) => v,
            DurationWindow::Asymmetric { after, .. } => after,
        }
    }
}

/// Options for [`crate::locate::locate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LocateOptions {
    /// Matches to find; `0` searches the whole audio. Default: 1.
    pub count: usize,
    /// Lead/trail seconds decoded around each estimate. Default: 3.0.
    pub duration_window: DurationWindow,
    /// Default: [`LocateMode::Transcribe`].
    pub mode: LocateMode,
    /// Search start in seconds. Default: none (0).
    pub start: Option<f64>,
    /// Search end in seconds. Default: none (end of audio).
    pub end: Option<f64>,
    /// Probability at which an expected token is accepted. Default: 0.5.
    pub probability_threshold: f32,
    /// Consecutive end-of-text tokens tolerated before a window gives up.
    /// Default: 1.
    pub eots: usize,
    /// Hard cap on decoded tokens per window. Default: 20.
    pub max_token_per_seg: usize,
    /// Match token ids instead of decoded text. Default: false.
    pub exact_token: bool,
    /// Case-sensitive text matching. Default: false.
    pub case_sensitive: bool,
    /// Text decoded as previous context. Default: none.
    pub initial_prompt: Option<String>,
    /// Token ids never emitted while confirming. Default: model set.
    pub suppress_tokens: Option<Vec<u32>>,
    /// Log each match at `info` instead of `debug`. Default: false.
    pub verbose: bool,
}

impl Default for LocateOptions {
    fn default() -> Self {
        Self {
            count: 1,
            duration_window: DurationWindow::Symmetric(3.0),
            mode: LocateMode::default(),
            start: None,
            end: None,
            probability_threshold: 0.5,
            eots: 1,
            max_token_per_seg: 20,
            exact_token: false,
            case_sensitive: false,
            initial_prompt: None,
            suppress_tokens: None,
            verbose: false,
        }
    }
}

impl LocateOptions {
    pub fn validate(&self, chunk_length_secs: f64) -> Result<()> {
        let (before, after) = (self.duration_window.before(), self.duration_window.after());
        if before < 0.0 || after < 0.0 {
            return Err(WordtimeError::InvalidOption(
                "duration_window must not be negative".into(),
            ));
        }
        if before + after >= chunk_length_secs {
            return Err(WordtimeError::InvalidOption(format!(
                "duration_window sum {:.2}s must be shorter than the {chunk_length_secs}s chunk",
                before + after
            )));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if end <= start {
                return Err(WordtimeError::InvalidOption(format!(
                    "end ({end}) must come after start ({start})"
                )));
            }
        }
        if self.max_token_per_seg == 0 {
            return Err(WordtimeError::InvalidOption(
                "max_token_per_seg must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
