//! Phrase search over long audio.
//!
//! ```text
//!  seek ──► 30 s chunk ──► decoder(prompt + phrase) cross-attention
//!                               │ peak of last phrase row
//!                               ▼
//!                      coarse end estimate ──(CoarseOnly)──► Unconfirmed
//!                               │
//!                               ▼
//!            [est - before, est + after] section, constrained decode
//!                               │ PhraseMatcher
//!               ┌───────────────┴───────────────┐
//!           confirmed                       abandoned
//!     Confirmed / Transcribed             seek += chunk - before
//! ```

pub mod matcher;

pub use matcher::{Action, Candidates, MatchRules, MatchState, PhraseMatcher, Prediction};

use ndarray::{s, Array2, Axis};
use tracing::{debug, info};

use crate::audio::{pad_or_trim, secs_to_samples};
use crate::config::{LocateMode, LocateOptions};
use crate::error::{Result, WordtimeError};
use crate::inference::{softmax, AttentionSink, DecodeCache, ModelDims, SequenceModel};
use crate::progress::Progress;
use crate::text::{
    is_space_delimited, normalize_language, split_word_tokens, TextTokenizer, WordTokens,
};
use crate::timing::attention::{alignment_matrix, peak_frame, MEDIAN_FILTER_WIDTH};
use crate::timing::{ExtractRequest, TimestampExtractor};
use crate::transcript::{round_ms, LocateMatch, Segment, WindowWord};

/// What to look for.
#[derive(Debug, Clone, Copy)]
pub enum LocateTarget<'a> {
    Text(&'a str),
    Tokens(&'a [u32]),
}

/// Everything fixed for the whole search.
struct Search<'a> {
    dims: ModelDims,
    language: String,
    /// Decoder context ahead of the phrase.
    prompt: Vec<u32>,
    phrase: Vec<u32>,
    phrase_text: String,
    suppress: Vec<u32>,
    opts: &'a LocateOptions,
}

/// Result of one window.
struct Window {
    /// Coarse estimate, seconds into the chunk.
    estimate: f64,
    found: Option<LocateMatch>,
    /// Next seek, in samples.
    next_seek: usize,
}

fn build_prompt(
    tokenizer: &dyn TextTokenizer,
    dims: &ModelDims,
    language: &str,
    initial_prompt: Option<&str>,
) -> Result<Vec<u32>> {
    let mut prompt = Vec::new();
    if let (Some(text), Some(sot_prev)) = (initial_prompt, tokenizer.sot_prev()) {
        let tokens = tokenizer.encode(&format!(" {}", text.trim()))?;
        let keep = (dims.n_text_ctx / 2).saturating_sub(1);
        prompt.push(sot_prev);
        prompt.extend_from_slice(&tokens[tokens.len().saturating_sub(keep)..]);
    }
    prompt.extend(tokenizer.sot_sequence(language)?);
    prompt.push(tokenizer.no_timestamps());
    Ok(prompt)
}

/// Indices of the two largest logits: `(best, runner_up)`.
fn top_two(logits: &[f32]) -> (u32, u32) {
    let mut best = (0usize, f32::NEG_INFINITY);
    let mut second = (0usize, f32::NEG_INFINITY);
    for (i, &v) in logits.iter().enumerate() {
        if v > best.1 {
            second = best;
            best = (i, v);
        } else if v > second.1 {
            second = (i, v);
        }
    }
    (best.0 as u32, second.0 as u32)
}

impl Search<'_> {
    fn sample_rate(&self) -> u32 {
        self.dims.sample_rate
    }

    /// Attention-peak estimate of the phrase end, in seconds into the chunk.
    fn coarse_end(
        &self,
        model: &mut dyn SequenceModel,
        mel: &Array2<f32>,
        audible_samples: usize,
    ) -> Result<f64> {
        let features = model.encode(mel.view().insert_axis(Axis(0)))?;
        let mut tokens = self.prompt.clone();
        tokens.extend_from_slice(&self.phrase);
        let mut sink = AttentionSink::new(self.dims.n_text_layer);
        model.decode(&tokens, &features, None, Some(&mut sink))?;

        let audible = (audible_samples / self.dims.hop_length).min(self.dims.n_frames()) / 2;
        let matrix = alignment_matrix(&sink, &self.dims.alignment_heads, audible, MEDIAN_FILTER_WIDTH)
            .ok_or_else(|| {
                WordtimeError::Inference("model reported no cross-attention for the alignment heads".into())
            })?;
        let last = matrix.len_of(Axis(0)).saturating_sub(1);
        let frame = peak_frame(matrix.row(last));
        Ok(round_ms(frame as f64 / self.dims.embeddings_per_second()))
    }

    fn rules(&self, eot: u32) -> MatchRules {
        MatchRules {
            target: self.phrase.clone(),
            target_text: self.phrase_text.clone(),
            exact_token: self.opts.exact_token,
            case_sensitive: self.opts.case_sensitive,
            probability_threshold: self.opts.probability_threshold,
            max_eots: self.opts.eots,
            max_tokens: self.opts.max_token_per_seg,
            eot,
        }
    }

    /// Constrained decode of one section; returns the finished matcher.
    fn confirm(
        &self,
        model: &mut dyn SequenceModel,
        tokenizer: &dyn TextTokenizer,
        section: &Array2<f32>,
    ) -> Result<PhraseMatcher> {
        let eot = tokenizer.eot();
        let features = model.encode(section.view().insert_axis(Axis(0)))?;
        let mut cache = DecodeCache::new();
        let mut matcher = PhraseMatcher::new(self.rules(eot), &self.prompt);
        let mut feed = self.prompt.clone();
        loop {
            let logits = model.decode(&feed, &features, Some(&mut cache), None)?;
            let last = logits.len_of(Axis(1)).saturating_sub(1);
            let width = (eot as usize + 1).min(logits.len_of(Axis(2)));
            let mut row = logits.slice(s![0, last, ..width]).to_vec();
            for &t in &self.suppress {
                if let Some(v) = row.get_mut(t as usize) {
                    *v = f32::NEG_INFINITY;
                }
            }
            let (best, runner_up) = top_two(&row);
            let best_non_eot = if best == eot { runner_up } else { best };
            let probs = softmax(&row[..width.min(eot as usize)]);
            match matcher.step(
                tokenizer,
                Candidates {
                    best,
                    best_non_eot,
                    probs: &probs,
                },
            )? {
                Action::Feed(tokens) => feed = tokens,
                Action::Replay(tokens) => {
                    cache.clear();
                    feed = tokens;
                }
                Action::Stop => break,
            }
        }
        Ok(matcher)
    }

    fn window_words(
        &self,
        tokenizer: &dyn TextTokenizer,
        matcher: &PhraseMatcher,
    ) -> Result<Vec<WindowWord>> {
        let eot = tokenizer.eot();
        let kept: Vec<Prediction> = matcher
            .predictions()
            .iter()
            .copied()
            .filter(|p| p.token < eot)
            .collect();
        let tokens: Vec<u32> = kept.iter().map(|p| p.token).collect();
        let words = split_word_tokens(&tokens, tokenizer, is_space_delimited(&self.language))?;
        let mut offset = 0usize;
        Ok(words
            .into_iter()
            .map(|w| {
                let probs = &kept[offset..offset + w.tokens.len()];
                offset += w.tokens.len();
                let probability = if probs.is_empty() {
                    0.0
                } else {
                    probs.iter().map(|p| p.prob.unwrap_or(0.0)).sum::<f32>() / probs.len() as f32
                };
                WindowWord {
                    text: w.text,
                    tokens: w.tokens,
                    probability,
                }
            })
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    fn window(
        &self,
        model: &mut dyn SequenceModel,
        tokenizer: &dyn TextTokenizer,
        extractor: &mut dyn TimestampExtractor,
        audio: &[f32],
        seek: usize,
        prev_estimate: Option<f64>,
        found_so_far: usize,
    ) -> Result<Window> {
        let sr = self.sample_rate();
        let chunk = self.dims.n_samples();
        let segment = &audio[seek..(seek + chunk).min(audio.len())];
        let seek_secs = seek as f64 / sr as f64;

        let mel = model.log_mel(segment, self.dims.sample_padding())?;
        let chunk_mel = pad_or_trim(mel.view(), self.dims.n_frames());
        let estimate = self.coarse_end(model, &chunk_mel, segment.len())?;
        debug!(seek = round_ms(seek_secs), estimate, "coarse estimate");

        if self.opts.mode == LocateMode::CoarseOnly {
            let step = secs_to_samples(estimate, sr);
            let capped = self.opts.count > 0 && found_so_far + 1 >= self.opts.count;
            let next_seek = if seek + chunk >= audio.len() {
                audio.len()
            } else if step == 0 || capped || prev_estimate == Some(estimate) {
                seek + chunk
            } else {
                seek + step
            };
            return Ok(Window {
                estimate,
                found: Some(LocateMatch::Unconfirmed {
                    end: round_ms(seek_secs + estimate),
                }),
                next_seek,
            });
        }

        let before = self.opts.duration_window.before();
        let after = self.opts.duration_window.after();
        let section_start = round_ms((estimate - before).max(0.0));
        let section_end = round_ms(estimate + after);
        let fps = self.dims.frames_per_second();
        let first_frame = ((section_start * fps).round() as usize).min(mel.len_of(Axis(1)));
        let last_frame = ((section_end * fps).round() as usize)
            .min(mel.len_of(Axis(1)))
            .max(first_frame);
        let section = pad_or_trim(mel.slice(s![.., first_frame..last_frame]), self.dims.n_frames());

        let matcher = self.confirm(model, tokenizer, &section)?;
        if !matcher.is_confirmed() {
            let step = if segment.len() == chunk {
                chunk.saturating_sub(secs_to_samples(before, sr)).max(1)
            } else {
                segment.len().max(1)
            };
            debug!(seek = round_ms(seek_secs), "phrase not confirmed");
            return Ok(Window {
                estimate,
                found: None,
                next_seek: seek + step,
            });
        }

        let window_words = self.window_words(tokenizer, &matcher)?;
        let past_section = seek + secs_to_samples(section_end, sr);
        match self.opts.mode {
            LocateMode::Transcribe => {
                let words: Vec<_> = window_words
                    .iter()
                    .map(|w| WordTokens {
                        text: w.text.clone(),
                        tokens: w.tokens.clone(),
                    })
                    .collect();
                let request = ExtractRequest {
                    mel: section.view(),
                    words: &words,
                    num_samples: secs_to_samples(section_end - section_start, sr),
                    time_offset: seek_secs + section_start,
                    language: &self.language,
                };
                let timed = extractor.extract(model, tokenizer, &request)?;
                let next_seek = match timed.last() {
                    Some(last) => secs_to_samples(last.end, sr).max(seek + 1),
                    None => past_section.max(seek + 1),
                };
                Ok(Window {
                    estimate,
                    found: Some(LocateMatch::Transcribed {
                        segment: Segment::new(found_so_far, timed),
                    }),
                    next_seek,
                })
            }
            LocateMode::Confirm | LocateMode::CoarseOnly => Ok(Window {
                estimate,
                found: Some(LocateMatch::Confirmed {
                    end: round_ms(seek_secs + estimate),
                    text: tokenizer.decode(&self.phrase)?,
                    window_text: window_words.iter().map(|w| w.text.as_str()).collect(),
                    window_words,
                }),
                next_seek: past_section.max(seek + 1),
            }),
        }
    }
}

/// Find occurrences of `target` in `audio` (mono samples at the model's
/// sample rate).
#[allow(clippy::too_many_arguments)]
pub fn locate(
    model: &mut dyn SequenceModel,
    tokenizer: &dyn TextTokenizer,
    extractor: &mut dyn TimestampExtractor,
    audio: &[f32],
    target: LocateTarget<'_>,
    language: &str,
    opts: &LocateOptions,
    progress: &mut Progress<'_>,
) -> Result<Vec<LocateMatch>> {
    let dims = model.dims().clone();
    opts.validate(dims.chunk_length as f64)?;
    let language = normalize_language(language)?;
    let eot = tokenizer.eot();

    let (phrase, text) = match target {
        LocateTarget::Text(text) => (tokenizer.encode(text)?, text.to_string()),
        LocateTarget::Tokens(tokens) => (tokens.to_vec(), tokenizer.decode(tokens)?),
    };
    let phrase: Vec<u32> = phrase.into_iter().filter(|&t| t < eot).collect();
    if phrase.is_empty() {
        return Err(WordtimeError::InvalidOption("phrase to locate is empty".into()));
    }
    let phrase_text = if opts.case_sensitive {
        text
    } else {
        text.to_lowercase()
    };

    let suppress: Vec<u32> = opts
        .suppress_tokens
        .as_ref()
        .unwrap_or(&dims.suppress_tokens)
        .iter()
        .copied()
        .filter(|&t| t < eot)
        .collect();
    let prompt = build_prompt(tokenizer, &dims, &language, opts.initial_prompt.as_deref())?;

    let sr = dims.sample_rate;
    let audio = match opts.end {
        Some(end) => &audio[..secs_to_samples(end, sr).min(audio.len())],
        None => audio,
    };
    let total = audio.len();
    let total_secs = total as f64 / sr as f64;
    let mut seek = opts.start.map_or(0, |s| secs_to_samples(s, sr));

    let search = Search {
        dims,
        language,
        prompt,
        phrase,
        phrase_text,
        suppress,
        opts,
    };

    info!(
        phrase = %search.phrase_text,
        tokens = search.phrase.len(),
        mode = ?opts.mode,
        count = opts.count,
        "locating"
    );

    let mut matches: Vec<LocateMatch> = Vec::new();
    let mut prev_estimate: Option<f64> = None;
    while seek < total && (opts.count == 0 || matches.len() < opts.count) {
        progress.check_cancelled()?;
        let window = search.window(
            model,
            tokenizer,
            extractor,
            audio,
            seek,
            prev_estimate,
            matches.len(),
        )?;
        prev_estimate = Some(window.estimate);
        if let Some(found) = window.found {
            if opts.verbose {
                info!(end = ?found.end(), "match");
            } else {
                debug!(end = ?found.end(), "match");
            }
            matches.push(found);
        }
        seek = window.next_seek.max(seek + 1);
        progress.report(seek as f64 / sr as f64, total_secs)?;
    }
    progress.report(total_secs, total_secs)?;
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::stub::{VocabTokenizer, NO_TIMESTAMPS, SOT, SOT_PREV};

    #[test]
    fn top_two_orders_by_value() {
        assert_eq!(top_two(&[0.1, 3.0, 2.0, f32::NEG_INFINITY]), (1, 2));
        assert_eq!(top_two(&[5.0, 1.0]), (0, 1));
    }

    #[test]
    fn prompt_carries_previous_context() {
        let tok = VocabTokenizer::new(["hello", "world"]);
        let dims = ModelDims::whisper(2, 2, 1006);
        let plain = build_prompt(&tok, &dims, "en", None).unwrap();
        assert_eq!(plain.first(), Some(&SOT));
        assert_eq!(plain.last(), Some(&NO_TIMESTAMPS));
        let with_ctx = build_prompt(&tok, &dims, "en", Some("hello world")).unwrap();
        assert_eq!(with_ctx[0], SOT_PREV);
        assert_eq!(with_ctx.len(), plain.len() + 3);
    }

    #[test]
    fn prompt_context_keeps_the_tail() {
        let tok = VocabTokenizer::new(["a"]);
        let mut dims = ModelDims::whisper(2, 2, 1006);
        dims.n_text_ctx = 8; // room for 3 context tokens
        let prompt = build_prompt(&tok, &dims, "en", Some("a a a a a a")).unwrap();
        assert_eq!(prompt.len(), 1 + 3 + 4);
    }
}
