//! Per-word bisection state.
//!
//! One [`SearchInterval`] per word and pass, stored in a `Vec` indexed by
//! the word's position in its batch. All positions are mel frames relative
//! to the batch start.
//!
//! Start pass: frames before `mid` are muted. An accepted probe means the
//! word survives losing them, so the start is at least `mid` and `min`
//! moves up. A rejected probe moves `max` down. End pass mirrors this with
//! frames from `mid` on muted.

use std::ops::Range;

use crate::config::Endpoint;

/// Mel update needed before the next probe of a word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Zero these frames.
    Mute(Range<usize>),
    /// Copy these frames back from the unmuted features.
    Restore(Range<usize>),
    /// Interval narrower than the precision; no more probes.
    Finished,
}

/// Where a finished search landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Never probed.
    Untouched,
    /// Latest midpoint the word survived.
    Accepted(usize),
    /// Every probe was rejected; the search converged here.
    RejectedOnly(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchInterval {
    min: usize,
    max: usize,
    mid: usize,
    finished: bool,
    last_accepted: Option<usize>,
    rejections: usize,
    previous_prob: Option<f32>,
}

fn half_width(min: usize, max: usize) -> usize {
    ((max - min) as f64 / 2.0).round() as usize
}

impl SearchInterval {
    /// Open interval over `[min, max]` probing its midpoint first.
    pub fn new(min: usize, max: usize) -> Self {
        let (min, max) = (min.min(max), min.max(max));
        Self {
            min,
            max,
            mid: min + half_width(min, max),
            finished: false,
            last_accepted: None,
            rejections: 0,
            previous_prob: None,
        }
    }

    /// Interval that is never probed.
    pub fn finished(at: usize) -> Self {
        Self {
            finished: true,
            ..Self::new(at, at)
        }
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn mid(&self) -> usize {
        self.mid
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// Half the current width, the quantity the precision is compared to.
    pub fn half_width(&self) -> usize {
        half_width(self.min, self.max)
    }

    /// Probability seen on the previous probe, if any.
    pub fn previous_prob(&self) -> Option<f32> {
        self.previous_prob
    }

    /// Record the verdict on the current midpoint and move to the next one.
    pub fn advance(
        &mut self,
        endpoint: Endpoint,
        accepted: bool,
        prob: f32,
        frame_precision: usize,
    ) -> Step {
        if self.finished {
            return Step::Finished;
        }
        self.previous_prob = Some(prob);
        match (endpoint, accepted) {
            (Endpoint::Start, true) | (Endpoint::End, false) => self.min = self.mid,
            (Endpoint::Start, false) | (Endpoint::End, true) => self.max = self.mid,
        }
        if accepted {
            self.last_accepted = Some(self.mid);
        } else {
            self.rejections += 1;
        }

        let half = self.half_width();
        if half < frame_precision {
            self.finished = true;
            return Step::Finished;
        }
        let next = self.min + half;
        let step = match (endpoint, accepted) {
            (Endpoint::Start, true) => Step::Mute(self.min..next),
            (Endpoint::Start, false) => Step::Restore(next..self.max),
            (Endpoint::End, true) => Step::Mute(next..self.max),
            (Endpoint::End, false) => Step::Restore(self.min..next),
        };
        self.mid = next;
        debug_assert!(self.min <= self.mid && self.mid <= self.max);
        step
    }

    pub fn outcome(&self) -> Outcome {
        match (self.last_accepted, self.rejections) {
            (Some(frame), _) => Outcome::Accepted(frame),
            (None, 0) => Outcome::Untouched,
            (None, _) => Outcome::RejectedOnly(self.mid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_midpoint() {
        let iv = SearchInterval::new(10, 50);
        assert_eq!((iv.min(), iv.mid(), iv.max()), (10, 30, 50));
        assert_eq!(iv.half_width(), 20);
    }

    #[test]
    fn start_accept_mutes_forward() {
        let mut iv = SearchInterval::new(0, 40);
        assert_eq!(iv.advance(Endpoint::Start, true, 0.9, 2), Step::Mute(20..30));
        assert_eq!((iv.min(), iv.mid(), iv.max()), (20, 30, 40));
    }

    #[test]
    fn start_reject_restores_back() {
        let mut iv = SearchInterval::new(0, 40);
        assert_eq!(iv.advance(Endpoint::Start, false, 0.1, 2), Step::Restore(10..20));
        assert_eq!((iv.min(), iv.mid(), iv.max()), (0, 10, 20));
    }

    #[test]
    fn end_pass_mirrors_start_pass() {
        let mut iv = SearchInterval::new(0, 40);
        assert_eq!(iv.advance(Endpoint::End, true, 0.9, 2), Step::Mute(10..20));
        assert_eq!(iv.advance(Endpoint::End, false, 0.1, 2), Step::Restore(10..15));
        assert_eq!((iv.min(), iv.mid(), iv.max()), (10, 15, 20));
    }

    #[test]
    fn half_width_never_grows_and_search_terminates() {
        let mut iv = SearchInterval::new(0, 1000);
        let mut last = iv.half_width();
        let mut steps = 0;
        let mut accept = true;
        while !iv.is_finished() {
            iv.advance(Endpoint::Start, accept, 0.5, 2);
            assert!(iv.half_width() <= last);
            last = iv.half_width();
            accept = !accept;
            steps += 1;
        }
        // ceil(log2(500 / 2)) + 1
        assert!(steps <= 10, "steps={steps}");
    }

    #[test]
    fn outcome_prefers_latest_acceptance() {
        let mut iv = SearchInterval::new(0, 40);
        assert_eq!(iv.outcome(), Outcome::Untouched);
        iv.advance(Endpoint::Start, false, 0.1, 2);
        assert_eq!(iv.outcome(), Outcome::RejectedOnly(10));
        iv.advance(Endpoint::Start, true, 0.9, 2);
        assert_eq!(iv.outcome(), Outcome::Accepted(10));
        assert!(SearchInterval::finished(7).is_finished());
    }
}
