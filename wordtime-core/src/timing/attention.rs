//! Cross-attention post-processing.
//!
//! Raw decoder cross-attention is noisy per head. Every consumer runs the
//! same chain before reading timing off it:
//!
//! ```text
//! sink ─► pick alignment heads ─► softmax over frames ─► z-score over tokens
//!      ─► median filter over frames ─► mean over heads ─► [tokens, frames]
//! ```

use ndarray::{Array2, Array3, ArrayView1, Axis};

use crate::inference::{AlignmentHead, AttentionSink};

/// Median filter width used by Whisper's timing heuristics.
pub const MEDIAN_FILTER_WIDTH: usize = 7;

/// Softmax each `(head, token)` row over the frame axis.
pub fn softmax_frames(weights: &mut Array3<f32>) {
    for mut row in weights.lanes_mut(Axis(2)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if !max.is_finite() {
            row.fill(0.0);
            continue;
        }
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
}

/// Standardize every `(head, frame)` column over the token axis.
/// Columns without spread become zero.
pub fn standardize_tokens(weights: &mut Array3<f32>) {
    for mut column in weights.lanes_mut(Axis(1)) {
        let n = column.len() as f32;
        if n == 0.0 {
            continue;
        }
        let mean = column.sum() / n;
        let var = column.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let std = var.sqrt();
        if std > f32::EPSILON {
            column.mapv_inplace(|v| (v - mean) / std);
        } else {
            column.fill(0.0);
        }
    }
}

fn reflect(i: isize, len: usize) -> usize {
    let max = len as isize - 1;
    let mut i = i;
    while i < 0 || i > max {
        i = if i < 0 { -i } else { 2 * max - i };
    }
    i as usize
}

/// Median filter along the frame axis with reflect padding. Rows shorter
/// than half the window are returned unchanged.
pub fn median_filter(weights: &Array3<f32>, width: usize) -> Array3<f32> {
    let pad = width / 2;
    let frames = weights.len_of(Axis(2));
    if width < 2 || frames <= pad {
        return weights.clone();
    }
    let mut out = weights.clone();
    let mut window = vec![0.0f32; width];
    for (src, mut dst) in weights.lanes(Axis(2)).into_iter().zip(out.lanes_mut(Axis(2))) {
        for f in 0..frames {
            for (k, slot) in window.iter_mut().enumerate() {
                *slot = src[reflect(f as isize + k as isize - pad as isize, frames)];
            }
            window.sort_by(f32::total_cmp);
            dst[f] = window[pad];
        }
    }
    out
}

/// Smoothed `[tokens, frames]` alignment matrix from the selected heads,
/// limited to the first `max_frames` encoder frames.
pub fn alignment_matrix(
    sink: &AttentionSink,
    heads: &[AlignmentHead],
    max_frames: usize,
    filter_width: usize,
) -> Option<Array2<f32>> {
    if heads.is_empty() {
        return None;
    }
    let mut weights = sink.select_heads(heads, max_frames.max(1))?;
    softmax_frames(&mut weights);
    standardize_tokens(&mut weights);
    let filtered = median_filter(&weights, filter_width);
    filtered.mean_axis(Axis(0))
}

/// Index of the largest value; the first one on ties.
pub fn peak_frame(row: ArrayView1<'_, f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_v), (i, &v)| {
            if v > best_v {
                (i, v)
            } else {
                (best, best_v)
            }
        })
        .0
}
