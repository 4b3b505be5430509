//! Grouping of words into inference-sized pieces.
//!
//! Both limits come from the model: a request may carry at most
//! `n_text_ctx - 6` text tokens, and one encoder pass sees one chunk of
//! audio. Align takes a token-budgeted prefix of its queue; refine groups
//! consecutive words into batches under both caps.

use std::collections::VecDeque;
use std::ops::Range;

use crate::config::RefineOptions;
use crate::text::WordTokens;
use crate::transcript::Word;

/// Longest span a single word may claim during refinement, so that any
/// word plus its neighbours fits one 30 s chunk.
pub const MAX_WORD_SPAN_SECS: f64 = 14.5;

/// Pop the longest prefix of `queue` whose token count fits `limit`.
///
/// Always takes at least one word, even when that word alone is over the
/// limit.
pub fn take_token_budget(queue: &mut VecDeque<WordTokens>, limit: usize) -> Vec<WordTokens> {
    let mut taken = Vec::new();
    let mut count = 0usize;
    while let Some(next) = queue.front() {
        let n = next.tokens.len();
        if !taken.is_empty() && count + n > limit {
            break;
        }
        count += n;
        if let Some(word) = queue.pop_front() {
            taken.push(word);
        }
    }
    taken
}

/// Admissible range for one word's endpoints, in absolute seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WordBounds {
    /// Earliest the start may move to.
    pub min_start: f64,
    /// Latest the end may move to.
    pub max_end: f64,
}

/// Clamp every word to its neighbours, the audio, the duration-change caps
/// and [`MAX_WORD_SPAN_SECS`]. The word's current span always stays inside
/// its bounds.
pub fn word_bounds(words: &[Word], total_duration: f64, opts: &RefineOptions) -> Vec<WordBounds> {
    words
        .iter()
        .enumerate()
        .map(|(i, w)| {
            let dur = w.duration().max(0.0);
            let mut min_start = (w.end - MAX_WORD_SPAN_SECS).max(0.0);
            let mut max_end = (w.start + MAX_WORD_SPAN_SECS).min(total_duration);
            if let Some(prev) = i.checked_sub(1).map(|p| &words[p]) {
                min_start = min_start.max(prev.end);
            }
            if let Some(next) = words.get(i + 1) {
                max_end = max_end.min(next.start);
            }
            if let Some(abs) = opts.abs_dur_change {
                min_start = min_start.max(w.start - abs);
                max_end = max_end.min(w.end + abs);
            }
            if let Some(rel) = opts.rel_dur_change {
                min_start = min_start.max(w.start - dur * rel);
                max_end = max_end.min(w.end + dur * rel);
            }
            WordBounds {
                min_start: min_start.min(w.start),
                max_end: max_end.max(w.end),
            }
        })
        .collect()
}

/// Split words into consecutive batches. A batch closes before the word
/// that would stretch it past `max_span_secs` (first word's `min_start` to
/// this word's `max_end`) or past `max_tokens` text tokens.
pub fn refine_batches(
    words: &[Word],
    bounds: &[WordBounds],
    max_tokens: usize,
    max_span_secs: f64,
) -> Vec<Range<usize>> {
    let mut batches = Vec::new();
    let mut first = 0usize;
    let mut tokens = 0usize;
    for (i, (w, b)) in words.iter().zip(bounds).enumerate() {
        let n = w.tokens.len();
        let over_span = b.max_end - bounds[first].min_start > max_span_secs;
        if i > first && (over_span || tokens + n > max_tokens) {
            batches.push(first..i);
            first = i;
            tokens = 0;
        }
        tokens += n;
    }
    if first < words.len() {
        batches.push(first..words.len());
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wt(n: usize) -> WordTokens {
        WordTokens {
            text: format!(" w{n}"),
            tokens: vec![1; n],
        }
    }

    fn word(start: f64, end: f64, n: usize) -> Word {
        Word::new(" w", vec![1; n], start, end)
    }

    #[test]
    fn budget_takes_longest_fitting_prefix() {
        let mut q: VecDeque<_> = [wt(3), wt(4), wt(2), wt(1)].into_iter().collect();
        let taken = take_token_budget(&mut q, 9);
        assert_eq!(taken.len(), 3);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn budget_always_takes_one_word() {
        let mut q: VecDeque<_> = [wt(12), wt(1)].into_iter().collect();
        let taken = take_token_budget(&mut q, 5);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].tokens.len(), 12);
        assert!(take_token_budget(&mut VecDeque::new(), 5).is_empty());
    }

    #[test]
    fn bounds_respect_neighbours_and_caps() {
        let words = vec![word(1.0, 2.0, 1), word(2.5, 3.5, 1), word(3.6, 4.0, 1)];
        let opts = RefineOptions::default(); // rel 0.5
        let b = word_bounds(&words, 10.0, &opts);
        assert_eq!(b[0].min_start, 0.5);
        assert_eq!(b[0].max_end, 2.5);
        assert_eq!(b[1].min_start, 2.0);
        assert_eq!(b[1].max_end, 3.6);
        assert!((b[2].max_end - 4.2).abs() < 1e-9);
    }

    #[test]
    fn bounds_never_exclude_the_current_span() {
        // overlapping input: previous end is after this start
        let words = vec![word(1.0, 2.2, 1), word(2.0, 3.0, 1)];
        let b = word_bounds(&words, 3.0, &RefineOptions::default());
        assert_eq!(b[1].min_start, 2.0);
        assert_eq!(b[0].max_end, 2.2);
    }

    #[test]
    fn absolute_duration_cap_limits_widening() {
        let words = vec![word(1.0, 2.0, 1), word(5.0, 6.0, 1)];
        let opts = RefineOptions {
            rel_dur_change: None,
            abs_dur_change: Some(0.2),
            ..RefineOptions::default()
        };
        let b = word_bounds(&words, 10.0, &opts);
        assert!((b[0].min_start - 0.8).abs() < 1e-9);
        assert!((b[0].max_end - 2.2).abs() < 1e-9);
        assert!((b[1].min_start - 4.8).abs() < 1e-9);
        assert!((b[1].max_end - 6.2).abs() < 1e-9);

        // the tighter of the two caps wins
        let both = RefineOptions {
            rel_dur_change: Some(0.1),
            ..opts
        };
        let b = word_bounds(&words, 10.0, &both);
        assert!((b[0].min_start - 0.9).abs() < 1e-9);
        assert!((b[1].max_end - 6.1).abs() < 1e-9);
    }

    #[test]
    fn span_cap_applies_without_duration_caps() {
        let words = vec![word(20.0, 21.0, 1)];
        let opts = RefineOptions {
            rel_dur_change: None,
            ..RefineOptions::default()
        };
        let b = word_bounds(&words, 60.0, &opts);
        assert_eq!(b[0].min_start, 6.5);
        assert_eq!(b[0].max_end, 34.5);
    }

    #[test]
    fn batches_split_on_span_and_tokens() {
        let words: Vec<_> = (0..8).map(|i| word(i as f64 * 10.0, i as f64 * 10.0 + 5.0, 2)).collect();
        let bounds: Vec<_> = words
            .iter()
            .map(|w| WordBounds {
                min_start: w.start,
                max_end: w.end,
            })
            .collect();
        let by_span = refine_batches(&words, &bounds, 100, 30.0);
        assert_eq!(by_span, vec![0..3, 3..6, 6..8]);
        let by_tokens = refine_batches(&words, &bounds, 4, 1_000.0);
        assert_eq!(by_tokens, vec![0..2, 2..4, 4..6, 6..8]);
    }
}
