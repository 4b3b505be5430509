//! `TimingEngine`: one model, one tokenizer, one extractor.
//!
//! ## Usage
//!
//! ```text
//! TimingEngine::new(model, tokenizer)
//!     ├─► align(audio, text)          → Option<Transcript>
//!     ├─► refine(audio, &mut t)       → t updated in place
//!     ├─► refined(audio, &t)          → refined copy, t untouched
//!     └─► locate(audio, phrase, lang) → Vec<LocateMatch>
//! ```
//!
//! ## Threading
//!
//! Every call takes `&mut self` and issues inference strictly serially. The
//! engine is `Send`, so it can be moved to a worker thread; other threads
//! stop a running call through [`TimingEngine::cancel_flag`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    align::{align, AlignInput},
    config::{AlignOptions, LocateOptions, RefineOptions},
    error::Result,
    inference::SequenceModel,
    locate::{locate, LocateTarget},
    progress::{CancelFlag, Progress, ProgressFn},
    refine::refine,
    text::TextTokenizer,
    timing::{AttentionAligner, TimestampExtractor},
    transcript::{LocateMatch, Transcript},
};

/// Default options for every engine call, loadable from one JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub align: AlignOptions,
    pub refine: RefineOptions,
    pub locate: LocateOptions,
}

impl EngineConfig {
    /// Read a camelCase JSON options file; missing sections keep defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(anyhow::Error::from)?;
        config.refine.validate()?;
        Ok(config)
    }
}

pub struct TimingEngine {
    config: EngineConfig,
    model: Box<dyn SequenceModel>,
    tokenizer: Box<dyn TextTokenizer>,
    extractor: Box<dyn TimestampExtractor>,
    cancel: CancelFlag,
}

impl TimingEngine {
    /// Engine with default options and the cross-attention DTW extractor.
    pub fn new(model: Box<dyn SequenceModel>, tokenizer: Box<dyn TextTokenizer>) -> Self {
        Self {
            config: EngineConfig::default(),
            model,
            tokenizer,
            extractor: Box::new(AttentionAligner::default()),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_extractor(mut self, extractor: Box<dyn TimestampExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    pub fn model(&self) -> &dyn SequenceModel {
        self.model.as_ref()
    }

    /// Clone of the flag that stops the current and future calls. Reset it
    /// with [`CancelFlag::reset`] before reusing the engine.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn progress<'a>(&self, callback: Option<&'a mut ProgressFn<'a>>) -> Progress<'a> {
        let progress = match callback {
            Some(cb) => Progress::with_callback(cb),
            None => Progress::silent(),
        };
        progress.cancel_on(self.cancel.clone())
    }

    /// Align text to `audio` (mono, at the model's sample rate).
    pub fn align(&mut self, audio: &[f32], input: AlignInput<'_>) -> Result<Option<Transcript>> {
        let opts = self.config.align.clone();
        self.align_with(audio, input, &opts, None)
    }

    pub fn align_with<'a>(
        &mut self,
        audio: &[f32],
        input: AlignInput<'_>,
        opts: &AlignOptions,
        callback: Option<&'a mut ProgressFn<'a>>,
    ) -> Result<Option<Transcript>> {
        let mut progress = self.progress(callback);
        align(
            self.model.as_mut(),
            self.tokenizer.as_ref(),
            self.extractor.as_mut(),
            audio,
            input,
            opts,
            &mut progress,
        )
    }

    /// Refine `transcript` in place.
    pub fn refine(&mut self, audio: &[f32], transcript: &mut Transcript) -> Result<()> {
        let opts = self.config.refine.clone();
        self.refine_with(audio, transcript, &opts, None)
    }

    pub fn refine_with<'a>(
        &mut self,
        audio: &[f32],
        transcript: &mut Transcript,
        opts: &RefineOptions,
        callback: Option<&'a mut ProgressFn<'a>>,
    ) -> Result<()> {
        let mut progress = self.progress(callback);
        refine(
            self.model.as_mut(),
            self.tokenizer.as_ref(),
            audio,
            transcript,
            opts,
            &mut progress,
        )
    }

    /// Refined copy of `transcript`; the input is left untouched.
    pub fn refined(&mut self, audio: &[f32], transcript: &Transcript) -> Result<Transcript> {
        let mut copy = transcript.clone();
        self.refine(audio, &mut copy)?;
        Ok(copy)
    }

    /// Find `phrase` in `audio`.
    pub fn locate(
        &mut self,
        audio: &[f32],
        phrase: LocateTarget<'_>,
        language: &str,
    ) -> Result<Vec<LocateMatch>> {
        let opts = self.config.locate.clone();
        self.locate_with(audio, phrase, language, &opts, None)
    }

    pub fn locate_with<'a>(
        &mut self,
        audio: &[f32],
        phrase: LocateTarget<'_>,
        language: &str,
        opts: &LocateOptions,
        callback: Option<&'a mut ProgressFn<'a>>,
    ) -> Result<Vec<LocateMatch>> {
        let mut progress = self.progress(callback);
        let matches = locate(
            self.model.as_mut(),
            self.tokenizer.as_ref(),
            self.extractor.as_mut(),
            audio,
            phrase,
            language,
            opts,
            &mut progress,
        )?;
        info!(matches = matches.len(), "locate finished");
        Ok(matches)
    }
}

impl std::fmt::Debug for TimingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimingEngine")
            .field("config", &self.config)
            .field("dims", self.model.dims())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
