//! `AttentionAligner`: word timestamps from cross-attention via DTW.
//!
//! One decoder pass over `sot_sequence + <|notimestamps|> + text + eot`
//! with attention captured. The smoothed alignment matrix is negated and
//! warped; every time the path steps onto a new token row, that row's frame
//! marks a token boundary. Word boundaries are read off those jumps.

use ndarray::{s, Array2, ArrayView2, Axis};
use tracing::debug;

use crate::error::{Result, WordtimeError};
use crate::inference::{softmax, AttentionSink, SequenceModel};
use crate::text::{PunctuationRules, TextTokenizer};
use crate::timing::attention::{alignment_matrix, MEDIAN_FILTER_WIDTH};
use crate::timing::{ExtractRequest, TimestampExtractor};
use crate::transcript::{round_ms, Word};

/// Lowest-cost monotonic path through `cost`, as `(row, column)` index
/// lists from the top-left to the bottom-right corner.
pub fn dynamic_time_warp(cost: ArrayView2<'_, f64>) -> (Vec<usize>, Vec<usize>) {
    let (n, m) = cost.dim();
    if n == 0 || m == 0 {
        return (Vec::new(), Vec::new());
    }
    let mut acc = Array2::<f64>::from_elem((n + 1, m + 1), f64::INFINITY);
    let mut trace = Array2::<u8>::from_elem((n + 1, m + 1), 2);
    acc[[0, 0]] = 0.0;

    for j in 1..=m {
        for i in 1..=n {
            let (c0, c1, c2) = (acc[[i - 1, j - 1]], acc[[i - 1, j]], acc[[i, j - 1]]);
            let (c, t) = if c0 < c1 && c0 < c2 {
                (c0, 0) // diagonal
            } else if c1 < c0 && c1 < c2 {
                (c1, 1) // down: next token, same frame
            } else {
                (c2, 2) // right: same token, next frame
            };
            acc[[i, j]] = cost[[i - 1, j - 1]] + c;
            trace[[i, j]] = t;
        }
    }
    trace.row_mut(0).fill(2);
    trace.column_mut(0).fill(1);

    let (mut i, mut j) = (n, m);
    let (mut rows, mut cols) = (Vec::new(), Vec::new());
    while i > 0 || j > 0 {
        rows.push(i.saturating_sub(1));
        cols.push(j.saturating_sub(1));
        match trace[[i, j]] {
            0 => {
                i -= 1;
                j -= 1;
            }
            1 => i -= 1,
            _ => j -= 1,
        }
    }
    rows.reverse();
    cols.reverse();
    (rows, cols)
}

/// Frame at which the path first reaches each row, in path order.
fn jump_frames(rows: &[usize], cols: &[usize]) -> Vec<usize> {
    rows.iter()
        .zip(cols)
        .enumerate()
        .filter(|(k, (row, _))| *k == 0 || rows[k - 1] != **row)
        .map(|(_, (_, &col))| col)
        .collect()
}

/// Default extraction adapter.
#[derive(Debug, Clone)]
pub struct AttentionAligner {
    filter_width: usize,
    punctuation: PunctuationRules,
}

impl Default for AttentionAligner {
    fn default() -> Self {
        Self {
            filter_width: MEDIAN_FILTER_WIDTH,
            punctuation: PunctuationRules::default(),
        }
    }
}

impl AttentionAligner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_punctuation(mut self, punctuation: PunctuationRules) -> Self {
        self.punctuation = punctuation;
        self
    }

    pub fn with_filter_width(mut self, width: usize) -> Self {
        self.filter_width = width;
        self
    }
}

impl TimestampExtractor for AttentionAligner {
    fn extract(
        &mut self,
        model: &mut dyn SequenceModel,
        tokenizer: &dyn TextTokenizer,
        request: &ExtractRequest<'_>,
    ) -> Result<Vec<Word>> {
        let text_tokens: Vec<u32> = request
            .words
            .iter()
            .flat_map(|w| w.tokens.iter().copied())
            .collect();
        if text_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let dims = model.dims().clone();
        let eot = tokenizer.eot();

        let sot = tokenizer.sot_sequence(request.language)?;
        let mut tokens = sot.clone();
        tokens.push(tokenizer.no_timestamps());
        tokens.extend_from_slice(&text_tokens);
        tokens.push(eot);

        let features = model.encode(request.mel.insert_axis(Axis(0)))?;
        let mut sink = AttentionSink::new(dims.n_text_layer);
        let logits = model.decode(&tokens, &features, None, Some(&mut sink))?;

        let token_probs: Vec<f32> = text_tokens
            .iter()
            .enumerate()
            .map(|(k, &t)| {
                let row = logits.slice(s![0, sot.len() + k, ..eot as usize]).to_vec();
                softmax(&row).get(t as usize).copied().unwrap_or(0.0)
            })
            .collect();

        let audible = (request.num_samples / dims.hop_length).min(dims.n_frames()) / 2;
        let matrix = alignment_matrix(&sink, &dims.alignment_heads, audible, self.filter_width)
            .ok_or_else(|| {
                WordtimeError::Inference("model reported no cross-attention for the alignment heads".into())
            })?;
        // Rows from <|notimestamps|> up to the last text token.
        let cost = matrix
            .slice(s![sot.len()..tokens.len() - 1, ..])
            .mapv(|v| -f64::from(v));
        let (rows, cols) = dynamic_time_warp(cost.view());
        let jump_times: Vec<f64> = jump_frames(&rows, &cols)
            .into_iter()
            .map(|f| f as f64 / dims.embeddings_per_second())
            .collect();

        let mut words = Vec::with_capacity(request.words.len());
        let mut boundary = 0usize;
        for w in request.words {
            let next = boundary + w.tokens.len();
            let start = jump_times.get(boundary).copied().unwrap_or(0.0);
            let end = jump_times.get(next).copied().unwrap_or(start).max(start);
            let probs = &token_probs[boundary..next];
            let probability = if probs.is_empty() {
                0.0
            } else {
                probs.iter().sum::<f32>() / probs.len() as f32
            };
            words.push(
                Word::new(
                    w.text.clone(),
                    w.tokens.clone(),
                    round_ms(request.time_offset + start),
                    round_ms(request.time_offset + end),
                )
                .with_probability(probability),
            );
            boundary = next;
        }

        debug!(
            words = words.len(),
            tokens = text_tokens.len(),
            audible_frames = audible,
            offset = request.time_offset,
            "attention alignment"
        );
        Ok(self.punctuation.merge(words))
    }
}
