//! Sequence-model abstraction.
//!
//! The `SequenceModel` trait decouples the timing engines from any specific
//! backend (scripted stub, ONNX Whisper, ...). The engines only ever need
//! three things from a model: log-mel features for raw samples, an encoder
//! pass, and a decoder pass that can optionally reuse a key/value cache and
//! report cross-attention.
//!
//! `&mut self` on `encode`/`decode` expresses that backends own mutable
//! session state. Calls are issued strictly serially; running independent
//! audio in parallel takes one model instance per worker.

pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxWhisper, OnnxWhisperConfig};

use std::any::Any;

use ndarray::{s, Array2, Array3, ArrayView3, Axis};

use crate::error::Result;

/// One `(decoder layer, head)` pair whose cross-attention tracks timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentHead {
    pub layer: usize,
    pub head: usize,
}

impl From<[usize; 2]> for AlignmentHead {
    fn from([layer, head]: [usize; 2]) -> Self {
        Self { layer, head }
    }
}

/// Static dimensions of a model, in the units the engines reason about.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDims {
    pub n_mels: usize,
    /// Encoder output frames per chunk (1500 for Whisper).
    pub n_audio_ctx: usize,
    /// Maximum decoder context in tokens (448 for Whisper).
    pub n_text_ctx: usize,
    pub n_text_layer: usize,
    pub n_text_head: usize,
    pub n_vocab: usize,
    pub sample_rate: u32,
    pub hop_length: usize,
    pub n_fft: usize,
    /// Seconds of audio per encoder chunk (30 for Whisper).
    pub chunk_length: usize,
    pub alignment_heads: Vec<AlignmentHead>,
    /// Ordinary token ids never emitted while confirming a phrase.
    pub suppress_tokens: Vec<u32>,
}

impl ModelDims {
    /// Whisper geometry for the given decoder shape: 80 mels, 16 kHz,
    /// 30 s chunks, alignment heads on the upper half of the decoder.
    pub fn whisper(n_text_layer: usize, n_text_head: usize, n_vocab: usize) -> Self {
        Self {
            n_mels: 80,
            n_audio_ctx: 1500,
            n_text_ctx: 448,
            n_text_layer,
            n_text_head,
            n_vocab,
            sample_rate: 16_000,
            hop_length: 160,
            n_fft: 400,
            chunk_length: 30,
            alignment_heads: default_alignment_heads(n_text_layer, n_text_head),
            suppress_tokens: Vec::new(),
        }
    }

    /// Mel frames per second (100 for Whisper).
    pub fn frames_per_second(&self) -> f64 {
        self.sample_rate as f64 / self.hop_length as f64
    }

    /// Mel frames per chunk (3000 for Whisper).
    pub fn n_frames(&self) -> usize {
        self.chunk_length * self.sample_rate as usize / self.hop_length
    }

    /// Samples per chunk (480 000 for Whisper).
    pub fn n_samples(&self) -> usize {
        self.chunk_length * self.sample_rate as usize
    }

    /// Encoder frames per second (50 for Whisper).
    pub fn embeddings_per_second(&self) -> f64 {
        self.n_audio_ctx as f64 / self.chunk_length as f64
    }

    /// Zero samples appended before computing log-mel features.
    pub fn sample_padding(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Text tokens one request may carry, leaving room for the prompt.
    pub fn max_text_tokens(&self) -> usize {
        self.n_text_ctx.saturating_sub(6)
    }
}

/// Whisper's fallback when a checkpoint ships no alignment-head table:
/// every head of the upper half of the decoder.
pub fn default_alignment_heads(n_text_layer: usize, n_text_head: usize) -> Vec<AlignmentHead> {
    (n_text_layer / 2..n_text_layer)
        .flat_map(|layer| (0..n_text_head).map(move |head| AlignmentHead { layer, head }))
        .collect()
}

/// Encoder output, `[batch, n_audio_ctx, d_model]`.
#[derive(Debug, Clone)]
pub struct AudioFeatures(pub Array3<f32>);

impl AudioFeatures {
    pub fn batch_size(&self) -> usize {
        self.0.len_of(Axis(0))
    }
}

/// Key/value state carried between incremental decode calls.
///
/// Owned by the caller for exactly one decoding window; dropping or
/// clearing it discards everything the model remembered. Backends keep
/// their own representation in `state` and downcast it on each call.
#[derive(Default)]
pub struct DecodeCache {
    tokens: Vec<u32>,
    state: Option<Box<dyn Any>>,
}

impl DecodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens the model has consumed under this cache.
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.state = None;
    }

    pub fn extend_tokens(&mut self, tokens: &[u32]) {
        self.tokens.extend_from_slice(tokens);
    }

    pub fn state_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.state.as_mut().and_then(|s| s.downcast_mut::<T>())
    }

    pub fn set_state<T: Any>(&mut self, state: T) {
        self.state = Some(Box::new(state));
    }
}

impl std::fmt::Debug for DecodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeCache")
            .field("tokens", &self.tokens.len())
            .finish_non_exhaustive()
    }
}

/// Collector for cross-attention scores of one decode call.
///
/// Backends record, per decoder layer, the pre-softmax scores of batch row 0
/// as `[heads, query_tokens, audio_frames]`.
#[derive(Debug, Default, Clone)]
pub struct AttentionSink {
    layers: Vec<Option<Array3<f32>>>,
}

impl AttentionSink {
    pub fn new(n_layers: usize) -> Self {
        Self {
            layers: vec![None; n_layers],
        }
    }

    pub fn record(&mut self, layer: usize, weights: Array3<f32>) {
        if layer >= self.layers.len() {
            self.layers.resize(layer + 1, None);
        }
        self.layers[layer] = Some(weights);
    }

    pub fn layer(&self, layer: usize) -> Option<&Array3<f32>> {
        self.layers.get(layer).and_then(Option::as_ref)
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(Option::is_none)
    }

    /// Stack the selected heads into `[heads, tokens, frames]`, keeping the
    /// first `max_frames` audio frames.
    pub fn select_heads(&self, heads: &[AlignmentHead], max_frames: usize) -> Option<Array3<f32>> {
        let mut picked: Vec<Array2<f32>> = Vec::with_capacity(heads.len());
        for h in heads {
            let layer = self.layer(h.layer)?;
            if h.head >= layer.len_of(Axis(0)) {
                return None;
            }
            let frames = layer.len_of(Axis(2)).min(max_frames);
            picked.push(layer.slice(s![h.head, .., ..frames]).to_owned());
        }
        let views: Vec<_> = picked.iter().map(|a| a.view()).collect();
        ndarray::stack(Axis(0), &views).ok()
    }
}

/// Contract for encoder-decoder speech models.
pub trait SequenceModel: Send {
    fn dims(&self) -> &ModelDims;

    /// Log-mel features `[n_mels, frames]` for `samples` with `padding`
    /// zero samples appended; one frame per hop.
    fn log_mel(&self, samples: &[f32], padding: usize) -> Result<Array2<f32>>;

    /// Run the encoder over `[batch, n_mels, n_frames]` features.
    fn encode(&mut self, mel: ArrayView3<'_, f32>) -> Result<AudioFeatures>;

    /// Run the decoder, returning logits `[batch, tokens.len(), n_vocab]`.
    ///
    /// `tokens` is shared by every audio row. With a cache, `tokens` are only
    /// the new tokens and the cache is extended. With a sink, cross-attention
    /// scores for the new tokens are recorded into it.
    fn decode(
        &mut self,
        tokens: &[u32],
        features: &AudioFeatures,
        cache: Option<&mut DecodeCache>,
        attention: Option<&mut AttentionSink>,
    ) -> Result<Array3<f32>>;

    /// Encoder + decoder in one call.
    fn forward(&mut self, mel: ArrayView3<'_, f32>, tokens: &[u32]) -> Result<Array3<f32>> {
        let features = self.encode(mel)?;
        self.decode(tokens, &features, None, None)
    }
}

impl std::fmt::Debug for dyn SequenceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceModel")
            .field("dims", self.dims())
            .finish_non_exhaustive()
    }
}

/// Numerically stable softmax of one logits row.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![0.0; logits.len()];
    }
    let exp: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|v| v / sum).collect()
}
