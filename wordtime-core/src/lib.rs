//! # wordtime-core
//!
//! Word-level timing on top of Whisper-style encoder-decoder models.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────── TimingEngine ─────────────┐
//! text ─────────► │ align  : token-budget windows         │ ─► Transcript
//! Transcript ───► │ refine : bisection over muted frames  │ ─► Transcript
//! phrase ───────► │ locate : attention peak + constrained │ ─► Vec<LocateMatch>
//!                 │          decode                       │
//!                 └───┬──────────────┬──────────────┬─────┘
//!                     │              │              │
//!              SequenceModel   TextTokenizer   TimestampExtractor
//!           (ScriptedModel,   (VocabTokenizer, (AttentionAligner)
//!            OnnxWhisper)      WhisperTokenizer)
//! ```
//!
//! All inference is serial; progress is reported between model calls and a
//! run can be cancelled there.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod align;
pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod inference;
pub mod locate;
pub mod partition;
pub mod progress;
pub mod refine;
pub mod text;
pub mod timing;
pub mod transcript;

// Convenience re-exports for downstream crates
pub use align::{align, AlignInput};
pub use config::{AlignOptions, DurationWindow, LocateMode, LocateOptions, RefineOptions};
pub use engine::{EngineConfig, TimingEngine};
pub use error::{Result, WordtimeError};
pub use inference::{ModelDims, SequenceModel};
pub use locate::{locate, LocateTarget};
pub use progress::{CancelFlag, Progress, ProgressFn};
pub use refine::refine;
pub use text::TextTokenizer;
pub use timing::{AttentionAligner, TimestampExtractor};
pub use transcript::{LocateMatch, Segment, Transcript, WindowWord, Word};

#[cfg(feature = "onnx")]
pub use inference::{OnnxWhisper, OnnxWhisperConfig};

#[cfg(feature = "onnx")]
pub use text::WhisperTokenizer;
