//! `ScriptedModel`: deterministic stand-in for an encoder-decoder model.
//!
//! Used by tests and for exercising the engines without model files. A
//! script lists which token is spoken when. [`ScriptedModel::render`] turns
//! the script into audio whose samples *are* the answer: every sample inside
//! token `i`'s span holds `(i + 1) / 1024`, silence holds 0.
//!
//! The model then behaves like a well-trained recognizer would:
//! - features: one mel band whose frame value is the sample at the frame
//!   centre, so zeroing frames silences exactly those 10 ms steps;
//! - decoder: after the tokens consumed so far, predicts the next token still
//!   audible in the features, with a logit that falls off sharply once part
//!   of that token's audio is muted; end-of-text once nothing is left;
//! - cross-attention: the row of a heard token scores 10.0 on the four
//!   encoder frames starting at the token's end; any other row scores 10.0
//!   where the token it predicts begins; 0 elsewhere.
//!
//! Uses the special ids of [`crate::text::stub`].

use ndarray::{s, Array2, Array3, ArrayView1, ArrayView3, Axis};
use tracing::debug;

use crate::error::{Result, WordtimeError};
use crate::inference::{
    AlignmentHead, AttentionSink, AudioFeatures, DecodeCache, ModelDims, SequenceModel,
};
use crate::text::stub::{EOT, VOCAB_SIZE};

const CODE_SCALE: f32 = 1024.0;
const FULL_CONFIDENCE: f32 = 12.0;
/// Logit lost per fraction of the token's audio that is muted.
const MUTE_PENALTY: f32 = 60.0;
const ATTENTION_PEAK: f32 = 10.0;
const ATTENTION_PEAK_FRAMES: usize = 4;
/// How far past the last match a consumed token may be found among the
/// heard tokens. Before the first match the whole row is searched.
const LOOKAHEAD: usize = 3;

/// One spoken token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptedToken {
    pub token: u32,
    pub start: f64,
    pub end: f64,
}

impl ScriptedToken {
    pub fn new(token: u32, start: f64, end: f64) -> Self {
        Self { token, start, end }
    }
}

/// A scripted token audible in a feature row.
#[derive(Debug, Clone, Copy)]
struct Heard {
    token: u32,
    frames: usize,
    first_frame: usize,
    last_frame: usize,
    full_frames: usize,
}

impl Heard {
    fn confidence(&self) -> f32 {
        let fraction = (self.frames as f32 / self.full_frames.max(1) as f32).min(1.0);
        (FULL_CONFIDENCE - MUTE_PENALTY * (1.0 - fraction)).clamp(0.0, FULL_CONFIDENCE)
    }
}

pub struct ScriptedModel {
    dims: ModelDims,
    script: Vec<ScriptedToken>,
    forward_calls: usize,
}

impl ScriptedModel {
    pub fn new(mut script: Vec<ScriptedToken>) -> Self {
        script.sort_by(|a, b| a.start.total_cmp(&b.start));
        let dims = ModelDims {
            n_mels: 1,
            n_text_layer: 2,
            n_text_head: 2,
            alignment_heads: vec![
                AlignmentHead { layer: 1, head: 0 },
                AlignmentHead { layer: 1, head: 1 },
            ],
            ..ModelDims::whisper(2, 2, VOCAB_SIZE)
        };
        Self {
            dims,
            script,
            forward_calls: 0,
        }
    }

    pub fn script(&self) -> &[ScriptedToken] {
        &self.script
    }

    /// Number of decoder calls served so far.
    pub fn forward_calls(&self) -> usize {
        self.forward_calls
    }

    /// Synthetic audio of `duration` seconds voicing the script.
    pub fn render(&self, duration: f64) -> Vec<f32> {
        let sr = self.dims.sample_rate as f64;
        let mut samples = vec![0.0f32; (duration * sr).round() as usize];
        for (i, tok) in self.script.iter().enumerate() {
            let from = ((tok.start * sr).round() as usize).min(samples.len());
            let to = ((tok.end * sr).round() as usize).min(samples.len());
            samples[from..to].fill((i + 1) as f32 / CODE_SCALE);
        }
        samples
    }

    fn full_frames(&self, index: usize) -> usize {
        let tok = &self.script[index];
        ((tok.end - tok.start) * self.dims.frames_per_second()).round() as usize
    }

    /// Scripted tokens audible in one feature row, in order of first
    /// appearance.
    fn hear(&self, row: ArrayView1<'_, f32>) -> Vec<Heard> {
        let mut heard: Vec<(usize, Heard)> = Vec::new();
        for (frame, &v) in row.iter().enumerate() {
            let code = (v * CODE_SCALE).round() as usize;
            if code == 0 || code > self.script.len() {
                continue;
            }
            let index = code - 1;
            match heard.iter_mut().find(|(i, _)| *i == index) {
                Some((_, h)) => {
                    h.frames += 1;
                    h.last_frame = frame;
                }
                None => heard.push((
                    index,
                    Heard {
                        token: self.script[index].token,
                        frames: 1,
                        first_frame: frame,
                        last_frame: frame,
                        full_frames: self.full_frames(index),
                    },
                )),
            }
        }
        heard.into_iter().map(|(_, h)| h).collect()
    }
}

impl SequenceModel for ScriptedModel {
    fn dims(&self) -> &ModelDims {
        &self.dims
    }

    fn log_mel(&self, samples: &[f32], padding: usize) -> Result<Array2<f32>> {
        let hop = self.dims.hop_length;
        let n_frames = (samples.len() + padding) / hop;
        Ok(Array2::from_shape_fn((1, n_frames), |(_, f)| {
            samples.get(f * hop + hop / 2).copied().unwrap_or(0.0)
        }))
    }

    fn encode(&mut self, mel: ArrayView3<'_, f32>) -> Result<AudioFeatures> {
        if mel.len_of(Axis(1)) != 1 {
            return Err(WordtimeError::Inference(format!(
                "scripted model expects 1 mel band, got {}",
                mel.len_of(Axis(1))
            )));
        }
        // [batch, 1, frames] → [batch, frames, 1]
        Ok(AudioFeatures(mel.permuted_axes([0, 2, 1]).to_owned()))
    }

    fn decode(
        &mut self,
        tokens: &[u32],
        features: &AudioFeatures,
        cache: Option<&mut DecodeCache>,
        attention: Option<&mut AttentionSink>,
    ) -> Result<Array3<f32>> {
        self.forward_calls += 1;

        let mut history: Vec<u32> = Vec::new();
        if let Some(cache) = cache {
            history.extend_from_slice(cache.tokens());
            cache.extend_tokens(tokens);
        }
        let first_new = history.len();
        history.extend_from_slice(tokens);

        let batch = features.batch_size();
        let mut logits = Array3::<f32>::zeros((batch, tokens.len(), self.dims.n_vocab));
        let n_ctx = self.dims.n_audio_ctx;
        let mut row0_attention = Array2::<f32>::zeros((tokens.len(), n_ctx));

        for b in 0..batch {
            let heard = self.hear(features.0.slice(s![b, .., 0]));
            let mut cursor = 0usize;
            let mut anchored = false;
            for (pos, &token) in history.iter().enumerate() {
                let mut matched = None;
                if token < EOT {
                    let reach = if anchored { cursor + LOOKAHEAD } else { heard.len() };
                    let window = cursor..heard.len().min(reach);
                    if let Some(j) = window.into_iter().find(|&j| heard[j].token == token) {
                        matched = Some(j);
                        cursor = j + 1;
                        anchored = true;
                    }
                }
                if pos < first_new {
                    continue;
                }
                let row = pos - first_new;
                let (next, logit) = match heard.get(cursor) {
                    Some(h) => (h.token, h.confidence()),
                    None => (EOT, FULL_CONFIDENCE),
                };
                logits[[b, row, next as usize]] = logit;

                if b == 0 {
                    let focus = match matched {
                        Some(j) => Some(heard[j].last_frame / 2 + 1),
                        None => heard.get(cursor).map(|h| h.first_frame / 2),
                    };
                    if let Some(from) = focus {
                        let from = from.min(n_ctx);
                        let to = (from + ATTENTION_PEAK_FRAMES).min(n_ctx);
                        row0_attention.slice_mut(s![row, from..to]).fill(ATTENTION_PEAK);
                    }
                }
            }
        }

        if let Some(sink) = attention {
            let heads = self.dims.n_text_head;
            let per_layer = row0_attention
                .insert_axis(Axis(0))
                .broadcast((heads, tokens.len(), n_ctx))
                .map(|v| v.to_owned())
                .ok_or_else(|| WordtimeError::Inference("attention broadcast failed".into()))?;
            for layer in 0..self.dims.n_text_layer {
                sink.record(layer, per_layer.clone());
            }
        }

        debug!(
            batch,
            new_tokens = tokens.len(),
            history = history.len(),
            "scripted decode"
        );
        Ok(logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pad_or_trim;
    use crate::inference::softmax;
    use crate::text::stub::{LANGUAGE, NO_TIMESTAMPS, SOT, TRANSCRIBE};
    use ndarray::Array3;

    fn model() -> ScriptedModel {
        ScriptedModel::new(vec![
            ScriptedToken::new(7, 0.5, 1.0),
            ScriptedToken::new(8, 1.2, 1.6),
        ])
    }

    fn features(model: &mut ScriptedModel, samples: &[f32]) -> AudioFeatures {
        let mel = model.log_mel(samples, 0).unwrap();
        let mel = pad_or_trim(mel.view(), model.dims().n_frames());
        model.encode(mel.insert_axis(Axis(0)).view()).unwrap()
    }

    fn argmax(row: &[f32]) -> usize {
        row.iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
                if v > bv {
                    (i, v)
                } else {
                    (bi, bv)
                }
            })
            .0
    }

    #[test]
    fn render_encodes_script_index() {
        let m = model();
        let audio = m.render(2.0);
        assert_eq!(audio.len(), 32_000);
        assert_eq!(audio[9_000], 1.0 / CODE_SCALE);
        assert_eq!(audio[20_000], 2.0 / CODE_SCALE);
        assert_eq!(audio[17_000], 0.0);
    }

    #[test]
    fn decoder_predicts_heard_tokens_in_order() {
        let mut m = model();
        let audio = m.render(2.0);
        let feats = features(&mut m, &audio);
        let prompt = [SOT, LANGUAGE, TRANSCRIBE, NO_TIMESTAMPS, 7, 8];
        let logits = m.decode(&prompt, &feats, None, None).unwrap();
        let row = |p: usize| logits.slice(s![0, p, ..]).to_vec();
        assert_eq!(argmax(&row(3)), 7);
        assert_eq!(argmax(&row(4)), 8);
        assert_eq!(argmax(&row(5)), EOT as usize);
    }

    #[test]
    fn muting_part_of_a_token_lowers_its_probability() {
        let mut m = model();
        let audio = m.render(2.0);
        let full = features(&mut m, &audio);
        let mut muted_audio = audio.clone();
        muted_audio[8_000..9_600].fill(0.0); // first 0.1 s of token 7
        let muted = features(&mut m, &muted_audio);
        let prompt = [SOT, LANGUAGE, TRANSCRIBE, NO_TIMESTAMPS];
        let p = |f: &AudioFeatures, m: &mut ScriptedModel| {
            let logits = m.decode(&prompt, f, None, None).unwrap();
            softmax(&logits.slice(s![0, 3, ..EOT as usize]).to_vec())[7]
        };
        let base = p(&full, &mut m);
        let lower = p(&muted, &mut m);
        assert!(base > 0.99, "base={base}");
        assert!(lower < base - 0.05, "lower={lower}");
    }

    #[test]
    fn cached_decode_matches_full_decode() {
        let mut m = model();
        let audio = m.render(2.0);
        let feats = features(&mut m, &audio);
        let mut cache = DecodeCache::new();
        let _ = m
            .decode(&[SOT, LANGUAGE, TRANSCRIBE, NO_TIMESTAMPS], &feats, Some(&mut cache), None)
            .unwrap();
        let step = m.decode(&[7], &feats, Some(&mut cache), None).unwrap();
        assert_eq!(step.dim(), (1, 1, VOCAB_SIZE));
        assert_eq!(argmax(&step.slice(s![0, 0, ..]).to_vec()), 8);
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn attention_peaks_after_token_end() {
        let mut m = model();
        let audio = m.render(2.0);
        let feats = features(&mut m, &audio);
        let mut sink = AttentionSink::new(2);
        m.decode(&[SOT, 7, 8], &feats, None, Some(&mut sink)).unwrap();
        let layer = sink.layer(1).unwrap();
        // token 8 ends at 1.6 s → encoder frame 80
        let row = layer.slice(s![0, 2, ..]).to_vec();
        assert_eq!(argmax(&row), 80);
        // <|startoftranscript|> predicts token 7, which starts at 0.5 s
        assert_eq!(argmax(&layer.slice(s![0, 0, ..]).to_vec()), 25);
    }

    #[test]
    fn batch_rows_are_independent() {
        let mut m = model();
        let audio = m.render(2.0);
        let mel = pad_or_trim(m.log_mel(&audio, 0).unwrap().view(), 3000);
        let mut batch = Array3::<f32>::zeros((2, 1, 3000));
        batch.slice_mut(s![0, .., ..]).assign(&mel); // row 1 stays silent
        let logits = m
            .forward(batch.view(), &[SOT, LANGUAGE, TRANSCRIBE, NO_TIMESTAMPS])
            .unwrap();
        assert_eq!(argmax(&logits.slice(s![0, 3, ..]).to_vec()), 7);
        assert_eq!(argmax(&logits.slice(s![1, 3, ..]).to_vec()), EOT as usize);
    }
}
