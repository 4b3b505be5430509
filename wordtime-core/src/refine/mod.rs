//! Bisection refinement of existing word timestamps.
//!
//! A word's boundary is where muting audio starts to hurt the model's
//! confidence in it. For each pass (starts, then ends, or as configured) the
//! words are grouped into batches; within a batch every word bisects its own
//! [`SearchInterval`] in parallel:
//!
//! ```text
//! baseline probs (no muting)
//!     │
//!     ▼
//! mute the half not being probed ──► probe ──► accept / reject per word
//!                                      ▲              │
//!                                      └── mute or ◄──┘
//!                                          restore frames
//! ```
//!
//! Even words probe on mel row 0 and odd words on row 1, so neighbouring
//! words never mute each other's audio and one two-row forward call serves
//! the whole batch.

pub mod interval;

use std::ops::Range;

use ndarray::{s, Array2, Array3, Axis};
use tracing::{debug, info};

use crate::audio::{mute_frames, pad_or_trim, restore_frames, secs_to_samples};
use crate::config::{Endpoint, RefineOptions};
use crate::error::{Result, WordtimeError};
use crate::inference::{softmax, SequenceModel};
use crate::partition::{refine_batches, word_bounds, WordBounds};
use crate::progress::Progress;
use crate::text::{normalize_language, TextTokenizer};
use crate::transcript::{round_ms, Transcript, Word};

pub use interval::{Outcome, SearchInterval, Step};

/// Probability and rank of one word's target token on one probe.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Reading {
    prob: f32,
    /// Number of vocabulary entries strictly more probable.
    rank: usize,
}

/// Thresholds a probe must clear to be accepted.
struct Verdict<'a> {
    opts: &'a RefineOptions,
}

impl Verdict<'_> {
    fn accepts(&self, baseline: Reading, previous: Option<f32>, now: Reading) -> bool {
        let o = self.opts;
        if baseline.prob <= 0.0 {
            return false;
        }
        let abs_drop = baseline.prob - now.prob;
        let rel_drop = abs_drop / baseline.prob;
        if abs_drop > o.abs_prob_decrease || rel_drop > o.rel_prob_decrease {
            return false;
        }
        if let Some(limit) = o.rel_rel_prob_decrease {
            let prev = previous.unwrap_or(baseline.prob);
            if prev <= 0.0 || (prev - now.prob) / prev > limit {
                return false;
            }
        }
        now.prob >= o.prob_threshold && now.rank <= baseline.rank
    }
}

/// One batch of words under refinement.
struct Batch<'a> {
    words: &'a [Word],
    bounds: &'a [WordBounds],
    /// Segment edge flags `(first, last)` per word.
    edges: &'a [(bool, bool)],
    offset: f64,
}

struct Refiner<'m, 'o> {
    model: &'m mut dyn SequenceModel,
    prompt: Vec<u32>,
    eot: u32,
    opts: &'o RefineOptions,
    frame_precision: usize,
    fps: f64,
}

impl Refiner<'_, '_> {
    fn to_frames(&self, secs: f64, offset: f64, limit: usize) -> usize {
        (((secs - offset) * self.fps).round().max(0.0) as usize).min(limit)
    }

    fn probe(&mut self, mel: &Array3<f32>, tokens: &[u32]) -> Result<Array3<f32>> {
        if !self.opts.single_batch {
            return self.model.forward(mel.view(), tokens);
        }
        let mut rows = Vec::with_capacity(mel.len_of(Axis(0)));
        for r in 0..mel.len_of(Axis(0)) {
            rows.push(self.model.forward(mel.slice(s![r..r + 1, .., ..]), tokens)?);
        }
        let views: Vec<_> = rows.iter().map(|a| a.view()).collect();
        ndarray::concatenate(Axis(0), &views)
            .map_err(|e| WordtimeError::Inference(format!("stacking probe rows: {e}")))
    }

    fn read(&self, logits: &Array3<f32>, row: usize, position: usize, token: u32) -> Reading {
        let probs = softmax(&logits.slice(s![row, position, ..self.eot as usize]).to_vec());
        let prob = probs.get(token as usize).copied().unwrap_or(0.0);
        let rank = probs.iter().filter(|&&p| p > prob).count();
        Reading { prob, rank }
    }

    /// Refine one batch, returning the new value of each word's endpoint.
    fn run_batch(
        &mut self,
        audio: &[f32],
        batch: &Batch<'_>,
        endpoint: Endpoint,
    ) -> Result<Vec<Option<f64>>> {
        let dims = self.model.dims().clone();
        let n_frames = dims.n_frames();
        let words = batch.words;

        let first_sample = secs_to_samples(batch.offset, dims.sample_rate).min(audio.len());
        let last_bound = batch.bounds.last().map_or(batch.offset, |b| b.max_end);
        let last_sample = (secs_to_samples(last_bound, dims.sample_rate) + 1).min(audio.len());
        let segment = &audio[first_sample..last_sample.max(first_sample)];
        let original: Array2<f32> = pad_or_trim(
            self.model.log_mel(segment, dims.sample_padding())?.view(),
            n_frames,
        );

        // Tokens and the position whose prediction is each word's target.
        let mut text_tokens = Vec::new();
        let mut targets: Vec<Option<(usize, u32)>> = Vec::with_capacity(words.len());
        for w in words {
            let own: Vec<u32> = w.tokens.iter().copied().filter(|&t| t < self.eot).collect();
            let pick = match endpoint {
                Endpoint::Start => own.first().map(|&t| (text_tokens.len(), t)),
                Endpoint::End => own.last().map(|&t| (text_tokens.len() + own.len() - 1, t)),
            };
            targets.push(pick.map(|(k, t)| (self.prompt.len() - 1 + k, t)));
            text_tokens.extend(own);
        }
        let mut tokens = self.prompt.clone();
        tokens.extend_from_slice(&text_tokens);
        tokens.push(self.eot);

        let mut intervals: Vec<SearchInterval> = words
            .iter()
            .zip(batch.bounds)
            .map(|(w, b)| {
                let (lo, hi) = match endpoint {
                    Endpoint::Start => (b.min_start, w.end),
                    Endpoint::End => (w.start, b.max_end),
                };
                SearchInterval::new(
                    self.to_frames(lo, batch.offset, n_frames),
                    self.to_frames(hi, batch.offset, n_frames),
                )
            })
            .collect();
        let initial_mids: Vec<usize> = intervals.iter().map(SearchInterval::mid).collect();

        let mut mel = Array3::<f32>::zeros((2, original.nrows(), n_frames));
        for mut row in mel.outer_iter_mut() {
            row.assign(&original);
        }
        let baseline_logits = self.probe(&mel, &tokens)?;
        let baselines: Vec<Option<Reading>> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| t.map(|(pos, tok)| self.read(&baseline_logits, i % 2, pos, tok)))
            .collect();

        for (i, w) in words.iter().enumerate() {
            let edge_ok = self.opts.word_level
                || match endpoint {
                    Endpoint::Start => batch.edges[i].0,
                    Endpoint::End => batch.edges[i].1,
                };
            let confident = baselines[i].is_some_and(|b| b.prob >= self.opts.prob_threshold);
            if w.is_instant() || !edge_ok || !confident {
                intervals[i] = SearchInterval::finished(intervals[i].mid());
                continue;
            }
            let row = mel.index_axis_mut(Axis(0), i % 2);
            let mid = intervals[i].mid();
            match endpoint {
                Endpoint::Start => {
                    let lower = if i == 0 { 0 } else { initial_mids[i - 1] };
                    mute_frames(row, lower, mid);
                }
                Endpoint::End => {
                    let upper = initial_mids.get(i + 1).copied().unwrap_or(n_frames);
                    mute_frames(row, mid, upper);
                }
            }
        }

        while intervals.iter().any(|iv| !iv.is_finished()) {
            let logits = self.probe(&mel, &tokens)?;
            for (i, iv) in intervals.iter_mut().enumerate() {
                if iv.is_finished() {
                    continue;
                }
                let (Some((pos, tok)), Some(baseline)) = (targets[i], baselines[i]) else {
                    iv.finish();
                    continue;
                };
                let reading = self.read(&logits, i % 2, pos, tok);
                let verdict = Verdict { opts: self.opts };
                let accepted = verdict.accepts(baseline, iv.previous_prob(), reading);
                let step = iv.advance(endpoint, accepted, reading.prob, self.frame_precision);
                let row = mel.index_axis_mut(Axis(0), i % 2);
                match step {
                    Step::Mute(r) => mute_frames(row, r.start, r.end),
                    Step::Restore(r) => restore_frames(row, original.view(), r.start, r.end),
                    Step::Finished => {}
                }
            }
        }

        Ok(words
            .iter()
            .zip(batch.bounds)
            .zip(&intervals)
            .map(|((w, b), iv)| self.resolve(w, b, iv, endpoint, batch.offset))
            .collect())
    }

    /// Turn a finished search into the endpoint's new value, if it moves.
    fn resolve(
        &self,
        word: &Word,
        bounds: &WordBounds,
        interval: &SearchInterval,
        endpoint: Endpoint,
        offset: f64,
    ) -> Option<f64> {
        let to_secs = |frame: usize| round_ms(offset + frame as f64 / self.fps);
        let candidate = match (interval.outcome(), endpoint) {
            (Outcome::Untouched, _) => return None,
            (Outcome::Accepted(f), _) => to_secs(f),
            (Outcome::RejectedOnly(f), Endpoint::Start) => {
                let t = to_secs(f);
                if t >= word.start {
                    return None;
                }
                t
            }
            (Outcome::RejectedOnly(f), Endpoint::End) => {
                let t = to_secs(f);
                if t <= word.end {
                    return None;
                }
                t
            }
        };
        let value = match endpoint {
            Endpoint::Start => candidate.clamp(bounds.min_start, word.end),
            Endpoint::End => candidate.clamp(word.start, bounds.max_end),
        };
        let current = match endpoint {
            Endpoint::Start => word.start,
            Endpoint::End => word.end,
        };
        (value != current).then_some(value)
    }
}

/// Refine the word timestamps of `transcript` in place.
///
/// `audio` is mono at the model's sample rate. Fails before any inference
/// when `opts.steps` holds anything but `s`/`e`, when the transcript has no
/// word timestamps, or when it carries no language.
pub fn refine(
    model: &mut dyn SequenceModel,
    tokenizer: &dyn TextTokenizer,
    audio: &[f32],
    transcript: &mut Transcript,
    opts: &RefineOptions,
    progress: &mut Progress<'_>,
) -> Result<()> {
    opts.validate()?;
    let passes = opts.passes()?;
    if !transcript.has_words() {
        return Err(WordtimeError::MissingWordTimestamps);
    }
    let language = normalize_language(
        transcript
            .language
            .as_deref()
            .ok_or(WordtimeError::MissingLanguage)?,
    )?;

    let dims = model.dims().clone();
    let mut prompt = tokenizer.sot_sequence(&language)?;
    prompt.push(tokenizer.no_timestamps());
    let total_duration = round_ms(audio.len() as f64 / dims.sample_rate as f64);
    let fps = dims.frames_per_second();
    let mut refiner = Refiner {
        model,
        prompt,
        eot: tokenizer.eot(),
        opts,
        frame_precision: opts.frame_precision(fps),
        fps,
    };
    let progress_total = total_duration * passes.len() as f64;

    for (pass_idx, &endpoint) in passes.iter().enumerate() {
        let words: Vec<Word> = transcript.words().cloned().collect();
        let edges = transcript.edge_flags();
        let bounds = word_bounds(&words, total_duration, opts);
        let batches: Vec<Range<usize>> = refine_batches(
            &words,
            &bounds,
            dims.max_text_tokens(),
            dims.chunk_length as f64,
        );
        debug!(?endpoint, words = words.len(), batches = batches.len(), "refine pass");

        let mut updates: Vec<Option<f64>> = vec![None; words.len()];
        for range in batches {
            progress.check_cancelled()?;
            let batch = Batch {
                words: &words[range.clone()],
                bounds: &bounds[range.clone()],
                edges: &edges[range.clone()],
                offset: bounds[range.start].min_start,
            };
            let moved = refiner.run_batch(audio, &batch, endpoint)?;
            updates[range.clone()].copy_from_slice(&moved);

            let done = words[range.end - 1].end;
            progress.report(pass_idx as f64 * total_duration + done, progress_total)?;
        }

        for ((word, update), before) in transcript.words_mut().zip(updates).zip(&words) {
            let Some(value) = update else { continue };
            let (label, old) = match endpoint {
                Endpoint::Start => ("start", before.start),
                Endpoint::End => ("end", before.end),
            };
            if opts.verbose {
                info!(word = %word.text, segment = word.segment_id, old, new = value, "{label} refined");
            } else {
                debug!(word = %word.text, segment = word.segment_id, old, new = value, "{label} refined");
            }
            match endpoint {
                Endpoint::Start => word.start = value,
                Endpoint::End => word.end = value,
            }
        }
    }
    progress.report(progress_total, progress_total)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(prob: f32, rank: usize) -> Reading {
        Reading { prob, rank }
    }

    #[test]
    fn verdict_rejects_large_drops() {
        let opts = RefineOptions::default();
        let v = Verdict { opts: &opts };
        let base = reading(0.95, 0);
        assert!(v.accepts(base, None, reading(0.94, 0)));
        assert!(!v.accepts(base, None, reading(0.89, 0))); // abs 0.06
        assert!(!v.accepts(base, None, reading(0.92, 0))); // rel > 0.03
        assert!(!v.accepts(base, None, reading(0.95, 1))); // rank regressed
    }

    #[test]
    fn verdict_enforces_threshold_and_iteration_drop() {
        let opts = RefineOptions {
            abs_prob_decrease: 1.0,
            rel_prob_decrease: 1.0,
            rel_rel_prob_decrease: Some(0.1),
            ..RefineOptions::default()
        };
        let v = Verdict { opts: &opts };
        let base = reading(0.9, 0);
        assert!(!v.accepts(base, None, reading(0.4, 0)));
        assert!(v.accepts(base, Some(0.6), reading(0.58, 0)));
        assert!(!v.accepts(base, Some(0.7), reading(0.6, 0)));
    }

    #[test]
    fn zero_probabilities_are_rejected_not_divided() {
        let opts = RefineOptions {
            prob_threshold: 0.0,
            rel_rel_prob_decrease: Some(0.5),
            ..RefineOptions::default()
        };
        let v = Verdict { opts: &opts };
        assert!(!v.accepts(reading(0.0, 0), None, reading(0.0, 0)));
        assert!(!v.accepts(reading(0.5, 0), Some(0.0), reading(0.5, 0)));
    }
}
