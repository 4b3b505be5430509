//! Whisper ONNX backend via the `ort` crate.
//!
//! Targets the HuggingFace `optimum` separate encoder + decoder export with
//! attentions enabled:
//! - `encoder_model.onnx`: `input_features [B,n_mels,3000]` →
//!   `last_hidden_state [B,1500,d_model]`
//! - `decoder_model.onnx`: `input_ids [B,seq]` + `encoder_hidden_states`
//!   → `logits [B,seq,vocab]`, `present.*`, `cross_attentions.{layer}`
//!   `[B,heads,seq,1500]`
//! - `decoder_with_past_model.onnx` (optional): same, plus
//!   `past_key_values.*` inputs for incremental decoding
//! - `config.json`: layer / head / vocab sizes
//! - `generation_config.json` (optional): `alignment_heads`,
//!   `suppress_tokens`
//!
//! ## Threading
//!
//! `WORDTIME_ORT_INTRA_THREADS` / `WORDTIME_ORT_INTER_THREADS` override the
//! session thread pools. Each `OnnxWhisper` owns its sessions; calls on one
//! instance are serial.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use ndarray::{s, Array2, Array3, ArrayView3};
use ort::session::{Session, SessionInputValue, SessionOutputs};
use ort::value::{DynValue, TensorRef};
use ort::{
    ep,
    session::builder::{GraphOptimizationLevel, SessionBuilder},
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    audio::mel::MelFrontend,
    error::{Result, WordtimeError},
    inference::{
        default_alignment_heads, AlignmentHead, AttentionSink, AudioFeatures, DecodeCache,
        ModelDims, SequenceModel,
    },
};

/// Environment variable naming the model directory.
pub const MODEL_DIR_ENV: &str = "WORDTIME_MODEL_DIR";

// ── Model config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OnnxWhisperConfig {
    pub encoder_path: PathBuf,
    pub decoder_path: PathBuf,
    pub decoder_with_past_path: Option<PathBuf>,
    pub tokenizer_path: PathBuf,
    pub config_path: PathBuf,
    pub generation_config_path: Option<PathBuf>,
}

impl Default for OnnxWhisperConfig {
    fn default() -> Self {
        Self::from_dir(&models_dir())
    }
}

impl OnnxWhisperConfig {
    /// Standard export layout under `dir`; optional files are kept only
    /// when present.
    pub fn from_dir(dir: &Path) -> Self {
        let decoder_with_past = dir.join("decoder_with_past_model.onnx");
        let generation_config = dir.join("generation_config.json");
        Self {
            encoder_path: dir.join("encoder_model.onnx"),
            decoder_path: dir.join("decoder_model.onnx"),
            decoder_with_past_path: decoder_with_past.exists().then_some(decoder_with_past),
            tokenizer_path: dir.join("tokenizer.json"),
            config_path: dir.join("config.json"),
            generation_config_path: generation_config.exists().then_some(generation_config),
        }
    }

    fn check_required(&self) -> Result<()> {
        for path in [
            &self.encoder_path,
            &self.decoder_path,
            &self.tokenizer_path,
            &self.config_path,
        ] {
            if !path.exists() {
                return Err(WordtimeError::ModelNotFound { path: path.clone() });
            }
        }
        Ok(())
    }
}

/// `$WORDTIME_MODEL_DIR`, or `./models`.
pub fn models_dir() -> PathBuf {
    match std::env::var(MODEL_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
        _ => PathBuf::from("models"),
    }
}

/// Subset of the HuggingFace `config.json` the engines need.
#[derive(Debug, Deserialize)]
struct HfConfig {
    #[serde(default = "default_mel_bins")]
    num_mel_bins: usize,
    #[serde(default = "default_source_positions")]
    max_source_positions: usize,
    #[serde(default = "default_target_positions")]
    max_target_positions: usize,
    decoder_layers: usize,
    decoder_attention_heads: usize,
    vocab_size: usize,
    #[serde(default)]
    suppress_tokens: Vec<u32>,
}

fn default_mel_bins() -> usize {
    80
}

fn default_source_positions() -> usize {
    1500
}

fn default_target_positions() -> usize {
    448
}

#[derive(Debug, Default, Deserialize)]
struct HfGenerationConfig {
    #[serde(default)]
    alignment_heads: Vec<[usize; 2]>,
    #[serde(default)]
    suppress_tokens: Vec<u32>,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| WordtimeError::Other(anyhow::anyhow!("{}: {e}", path.display())))
}

fn dims_from_config(config: &HfConfig, generation: &HfGenerationConfig) -> ModelDims {
    let mut dims = ModelDims::whisper(
        config.decoder_layers,
        config.decoder_attention_heads,
        config.vocab_size,
    );
    dims.n_mels = config.num_mel_bins;
    dims.n_audio_ctx = config.max_source_positions;
    dims.n_text_ctx = config.max_target_positions;
    dims.alignment_heads = if generation.alignment_heads.is_empty() {
        default_alignment_heads(config.decoder_layers, config.decoder_attention_heads)
    } else {
        generation
            .alignment_heads
            .iter()
            .copied()
            .map(AlignmentHead::from)
            .collect()
    };
    dims.suppress_tokens = if generation.suppress_tokens.is_empty() {
        config.suppress_tokens.clone()
    } else {
        generation.suppress_tokens.clone()
    };
    dims
}

// ── Sessions ─────────────────────────────────────────────────────────────────

fn ort_err(e: impl std::fmt::Display) -> WordtimeError {
    WordtimeError::OnnxSession(e.to_string())
}

fn env_threads(var: &str, default: usize, max: usize) -> usize {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
        .clamp(1, max)
}

fn create_session(model_path: &Path) -> Result<Session> {
    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let intra_threads = env_threads("WORDTIME_ORT_INTRA_THREADS", logical_cores.clamp(2, 12), 32);
    let inter_threads = env_threads("WORDTIME_ORT_INTER_THREADS", 1, 8);

    let builder = SessionBuilder::new()
        .map_err(ort_err)?
        .with_intra_threads(intra_threads)
        .map_err(ort_err)?
        .with_inter_threads(inter_threads)
        .map_err(ort_err)?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(ort_err)?
        .with_execution_providers([ep::CPU::default().build()])
        .map_err(ort_err)?;
    debug!(
        model = %model_path.display(),
        intra_threads,
        inter_threads,
        "creating ONNX session"
    );
    builder.commit_from_file(model_path).map_err(ort_err)
}

fn past_input_names(session: &Session) -> Vec<String> {
    session
        .inputs()
        .iter()
        .map(|i| i.name().to_string())
        .filter(|n| n.starts_with("past_key_values."))
        .collect()
}

fn present_to_past_input_name(output_name: &str) -> Option<String> {
    if let Some(rest) = output_name.strip_prefix("present.") {
        return Some(format!("past_key_values.{rest}"));
    }
    if let Some(rest) = output_name.strip_prefix("present_key_values.") {
        return Some(format!("past_key_values.{rest}"));
    }
    None
}

/// Move every `present.*` output wanted by `required` into `into`, renamed
/// to its `past_key_values.*` input.
fn collect_present_key_values(
    outputs: &mut SessionOutputs<'_>,
    required: &HashSet<String>,
    into: &mut HashMap<String, DynValue>,
) {
    let names: Vec<String> = outputs.keys().map(|n| n.to_string()).collect();
    for name in names {
        let Some(mapped) = present_to_past_input_name(&name) else {
            continue;
        };
        if !required.contains(&mapped) {
            continue;
        }
        if let Some(value) = outputs.remove(&name) {
            into.insert(mapped, value);
        }
    }
}

fn extract_array3(outputs: &SessionOutputs<'_>, name: &str) -> Result<Array3<f32>> {
    let value = outputs
        .get(name)
        .ok_or_else(|| WordtimeError::OnnxSession(format!("model has no output {name:?}")))?;
    let (shape, data) = value.try_extract_tensor::<f32>().map_err(ort_err)?;
    if shape.len() != 3 {
        return Err(WordtimeError::OnnxSession(format!(
            "output {name:?} has rank {}, expected 3",
            shape.len()
        )));
    }
    let dim = (shape[0] as usize, shape[1] as usize, shape[2] as usize);
    Array3::from_shape_vec(dim, data.to_vec()).map_err(ort_err)
}

/// Record cross-attention of batch row 0 for every layer.
///
/// Exports emit post-softmax weights; their log is fed to the sink so the
/// downstream softmax over frames restores them.
fn record_cross_attention(
    outputs: &SessionOutputs<'_>,
    n_layers: usize,
    sink: &mut AttentionSink,
) -> Result<()> {
    for layer in 0..n_layers {
        let name = format!("cross_attentions.{layer}");
        let Some(value) = outputs.get(name.as_str()) else {
            continue;
        };
        let (shape, data) = value.try_extract_tensor::<f32>().map_err(ort_err)?;
        if shape.len() != 4 {
            return Err(WordtimeError::OnnxSession(format!(
                "{name} has rank {}, expected 4",
                shape.len()
            )));
        }
        let (heads, queries, frames) = (shape[1] as usize, shape[2] as usize, shape[3] as usize);
        let row0 = &data[..heads * queries * frames];
        let weights = Array3::from_shape_vec((heads, queries, frames), row0.to_vec())
            .map_err(ort_err)?
            .mapv(|p| p.max(1e-10).ln());
        sink.record(layer, weights);
    }
    if sink.is_empty() {
        return Err(WordtimeError::Inference(
            "decoder export has no cross_attentions outputs; re-export with attentions enabled"
                .into(),
        ));
    }
    Ok(())
}

/// Past key/values of one decoding window.
#[derive(Default)]
struct OnnxCache {
    past: HashMap<String, DynValue>,
}

// ── OnnxWhisper ──────────────────────────────────────────────────────────────

pub struct OnnxWhisper {
    dims: ModelDims,
    encoder: Session,
    decoder: Session,
    decoder_with_past: Option<Session>,
    past_inputs: Vec<String>,
    frontend: MelFrontend,
}

impl OnnxWhisper {
    /// Load every session and read the model's dimensions.
    pub fn load(config: &OnnxWhisperConfig) -> Result<Self> {
        config.check_required()?;
        let hf: HfConfig = read_json(&config.config_path)?;
        let generation: HfGenerationConfig = match &config.generation_config_path {
            Some(path) => read_json(path)?,
            None => HfGenerationConfig::default(),
        };
        let dims = dims_from_config(&hf, &generation);

        let encoder = create_session(&config.encoder_path)?;
        let decoder = create_session(&config.decoder_path)?;
        let decoder_with_past = match &config.decoder_with_past_path {
            Some(path) => match create_session(path) {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(error = %e, "decoder_with_past unavailable; decoding without cache");
                    None
                }
            },
            None => None,
        };
        let past_inputs = decoder_with_past
            .as_ref()
            .map(past_input_names)
            .unwrap_or_default();

        info!(
            layers = dims.n_text_layer,
            heads = dims.n_text_head,
            vocab = dims.n_vocab,
            alignment_heads = dims.alignment_heads.len(),
            cached_decoding = !past_inputs.is_empty(),
            "whisper model loaded"
        );
        Ok(Self {
            frontend: MelFrontend::whisper(dims.n_mels),
            dims,
            encoder,
            decoder,
            decoder_with_past,
            past_inputs,
        })
    }

    fn batch_ids(tokens: &[u32], batch: usize) -> Vec<i64> {
        let row: Vec<i64> = tokens.iter().map(|&t| i64::from(t)).collect();
        row.repeat(batch)
    }
}

impl SequenceModel for OnnxWhisper {
    fn dims(&self) -> &ModelDims {
        &self.dims
    }

    fn log_mel(&self, samples: &[f32], padding: usize) -> Result<Array2<f32>> {
        Ok(self.frontend.compute(samples, padding))
    }

    fn encode(&mut self, mel: ArrayView3<'_, f32>) -> Result<AudioFeatures> {
        let (batch, n_mels, frames) = mel.dim();
        let mel = mel.as_standard_layout();
        let data = mel
            .as_slice()
            .ok_or_else(|| WordtimeError::Inference("mel features are not contiguous".into()))?;
        let input = TensorRef::from_array_view(([batch as i64, n_mels as i64, frames as i64], data))
            .map_err(ort_err)?;
        let outputs = self
            .encoder
            .run(ort::inputs!["input_features" => input])
            .map_err(ort_err)?;
        Ok(AudioFeatures(extract_array3(&outputs, "last_hidden_state")?))
    }

    fn decode(
        &mut self,
        tokens: &[u32],
        features: &AudioFeatures,
        mut cache: Option<&mut DecodeCache>,
        attention: Option<&mut AttentionSink>,
    ) -> Result<Array3<f32>> {
        let (batch, n_ctx, d_model) = features.0.dim();
        let hidden = features.0.as_standard_layout();
        let hidden = hidden.as_slice().ok_or_else(|| {
            WordtimeError::Inference("encoder features are not contiguous".into())
        })?;
        let hidden_shape = [batch as i64, n_ctx as i64, d_model as i64];
        let required: HashSet<String> = self.past_inputs.iter().cloned().collect();
        let n_layers = self.dims.n_text_layer;

        let has_past = cache.as_deref_mut().is_some_and(|c| {
            c.state_mut::<OnnxCache>()
                .is_some_and(|state| required.iter().all(|n| state.past.contains_key(n)))
        });
        let use_past = has_past && !required.is_empty() && attention.is_none();
        let caching = cache.is_some() && !required.is_empty();

        // Full-sequence decoding replays cached tokens; logits of the new
        // tokens are the trailing rows.
        let history: Vec<u32> = match cache.as_deref() {
            Some(c) if !use_past => c.tokens().iter().chain(tokens).copied().collect(),
            _ => tokens.to_vec(),
        };
        let ids = Self::batch_ids(&history, batch);

        let (logits, present) = {
            let input_ids =
                TensorRef::from_array_view(([batch as i64, history.len() as i64], ids.as_slice()))
                    .map_err(ort_err)?;
            let encoder_hidden_states =
                TensorRef::from_array_view((hidden_shape, hidden)).map_err(ort_err)?;

            let mut outputs = if use_past {
                let Some(state) = cache.as_deref_mut().and_then(|c| c.state_mut::<OnnxCache>())
                else {
                    return Err(WordtimeError::OnnxSession("decode cache state lost".into()));
                };
                let Some(session) = self.decoder_with_past.as_mut() else {
                    return Err(WordtimeError::OnnxSession(
                        "decoder_with_past session unavailable".into(),
                    ));
                };
                let mut inputs: Vec<(String, SessionInputValue<'_>)> =
                    Vec::with_capacity(2 + self.past_inputs.len());
                inputs.push(("input_ids".into(), SessionInputValue::from(input_ids)));
                inputs.push((
                    "encoder_hidden_states".into(),
                    SessionInputValue::from(encoder_hidden_states),
                ));
                for name in &self.past_inputs {
                    let Some(v) = state.past.get(name) else {
                        return Err(WordtimeError::OnnxSession(format!(
                            "missing cached past key/value input: {name}"
                        )));
                    };
                    inputs.push((name.clone(), SessionInputValue::from(v)));
                }
                session.run(inputs).map_err(ort_err)?
            } else {
                self.decoder
                    .run(ort::inputs![
                        "input_ids"             => input_ids,
                        "encoder_hidden_states" => encoder_hidden_states,
                    ])
                    .map_err(ort_err)?
            };

            let logits = extract_array3(&outputs, "logits")?;
            if let Some(sink) = attention {
                record_cross_attention(&outputs, n_layers, sink)?;
            }
            let mut present = HashMap::new();
            if caching {
                collect_present_key_values(&mut outputs, &required, &mut present);
            }
            (logits, present)
        };

        if let Some(cache) = cache {
            if caching {
                // decoder_with_past re-emits decoder entries only; encoder
                // entries from the first call stay.
                let mut state = if use_past {
                    cache
                        .state_mut::<OnnxCache>()
                        .map(std::mem::take)
                        .unwrap_or_default()
                } else {
                    OnnxCache::default()
                };
                state.past.extend(present);
                cache.set_state(state);
            }
            cache.extend_tokens(tokens);
        }

        let new_rows = tokens.len().min(logits.dim().1);
        let from = logits.dim().1 - new_rows;
        Ok(logits.slice(s![.., from.., ..]).to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_outputs_map_to_past_inputs() {
        assert_eq!(
            present_to_past_input_name("present.0.decoder.key").as_deref(),
            Some("past_key_values.0.decoder.key")
        );
        assert_eq!(
            present_to_past_input_name("present_key_values.3.encoder.value").as_deref(),
            Some("past_key_values.3.encoder.value")
        );
        assert!(present_to_past_input_name("logits").is_none());
    }

    #[test]
    fn dims_read_generation_heads() {
        let hf: HfConfig = serde_json::from_str(
            r#"{"decoder_layers": 4, "decoder_attention_heads": 6, "vocab_size": 51865,
                "num_mel_bins": 80, "suppress_tokens": [1, 2]}"#,
        )
        .unwrap();
        let generation: HfGenerationConfig =
            serde_json::from_str(r#"{"alignment_heads": [[3, 1], [2, 5]]}"#).unwrap();
        let dims = dims_from_config(&hf, &generation);
        assert_eq!(dims.n_text_ctx, 448);
        assert_eq!(
            dims.alignment_heads,
            vec![AlignmentHead { layer: 3, head: 1 }, AlignmentHead { layer: 2, head: 5 }]
        );
        assert_eq!(dims.suppress_tokens, vec![1, 2]);
    }

    #[test]
    fn missing_heads_fall_back_to_upper_half() {
        let hf: HfConfig = serde_json::from_str(
            r#"{"decoder_layers": 2, "decoder_attention_heads": 2, "vocab_size": 100}"#,
        )
        .unwrap();
        let dims = dims_from_config(&hf, &HfGenerationConfig::default());
        assert_eq!(dims.alignment_heads.len(), 2);
        assert!(dims.alignment_heads.iter().all(|h| h.layer == 1));
    }

    #[test]
    fn missing_files_are_reported() {
        let config = OnnxWhisperConfig::from_dir(Path::new("/nonexistent/wordtime"));
        assert!(config.decoder_with_past_path.is_none());
        assert!(matches!(
            OnnxWhisper::load(&config),
            Err(WordtimeError::ModelNotFound { .. })
        ));
    }
}
