//! Online phrase matcher driving the confirmation decode.
//!
//! ```text
//!            accept (decoder agreed)          accept, last target token
//!   ┌────────────────────┐   ┌──────────────────────────────────────┐
//!   ▼                    │   │                                      ▼
//! Matching ──────────────┴───┴──► BufferedMismatch ──────────► Confirmed
//!   ▲      accept (forced over the      │ accept                    │
//!   │       decoder's own choice)       ▼                           │ eot / cap
//!   └──────── rewind on mismatch ◄──────┘                           ▼
//!                                                                 (stop)
//!   Matching / BufferedMismatch ── eot limit or token cap ──► Abandoned
//! ```
//!
//! While the phrase is being matched the expected token is forced into the
//! decode even when the decoder preferred something else; the preferred
//! tokens are buffered. If matching then breaks, the forced tokens are
//! swapped back for the buffered ones, the cache is dropped, the corrected
//! sequence is replayed and matching restarts from the first target token.

use crate::error::Result;
use crate::text::TextTokenizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Matching,
    BufferedMismatch,
    Confirmed,
    Abandoned,
}

/// How the target phrase is recognized.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRules {
    /// Token ids of the phrase.
    pub target: Vec<u32>,
    /// Phrase text for string matching; lower-cased unless case sensitive.
    pub target_text: String,
    pub exact_token: bool,
    pub case_sensitive: bool,
    pub probability_threshold: f32,
    /// Consecutive end-of-text predictions tolerated before stopping.
    pub max_eots: usize,
    /// Hard cap on predictions per window.
    pub max_tokens: usize,
    pub eot: u32,
}

/// Decoder output for one step, after suppression.
#[derive(Debug, Clone, Copy)]
pub struct Candidates<'a> {
    pub best: u32,
    /// `best`, or the runner-up when `best` is end-of-text.
    pub best_non_eot: u32,
    /// Softmax over ordinary tokens (ids below end-of-text).
    pub probs: &'a [f32],
}

/// What the decode loop does next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Decode these tokens on top of the cache.
    Feed(Vec<u32>),
    /// Clear the cache, then decode this whole sequence.
    Replay(Vec<u32>),
    Stop,
}

/// One emitted token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub token: u32,
    /// `None` for end-of-text.
    pub prob: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct PhraseMatcher {
    rules: MatchRules,
    state: MatchState,
    cursor: usize,
    eot_run: usize,
    /// Decoder's own choices at positions where a target token was forced.
    buffered: Vec<Prediction>,
    /// Running best non-eot tokens for string matching.
    spelled: Vec<u32>,
    predictions: Vec<Prediction>,
    /// Every token fed to the decoder since the window started.
    history: Vec<u32>,
}

impl PhraseMatcher {
    /// `prompt` is the initial decoder context.
    pub fn new(rules: MatchRules, prompt: &[u32]) -> Self {
        Self {
            rules,
            state: MatchState::Matching,
            cursor: 0,
            eot_run: 0,
            buffered: Vec::new(),
            spelled: Vec::new(),
            predictions: Vec::new(),
            history: prompt.to_vec(),
        }
    }

    pub fn state(&self) -> MatchState {
        self.state
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == MatchState::Confirmed
    }

    /// Index of the next target token to match.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn predictions(&self) -> &[Prediction] {
        &self.predictions
    }

    fn prob_of(probs: &[f32], token: u32) -> f32 {
        probs.get(token as usize).copied().unwrap_or(0.0)
    }

    fn string_match(&mut self, tokenizer: &dyn TextTokenizer, token: u32) -> Result<bool> {
        self.spelled.push(token);
        let mut text = tokenizer.decode(&self.spelled)?;
        if !self.rules.case_sensitive {
            text = text.to_lowercase();
        }
        let matched = text.ends_with(&self.rules.target_text);
        if matched {
            self.spelled.clear();
        }
        Ok(matched)
    }

    /// Rewind forced tokens to the decoder's own choices. Returns the
    /// corrected history.
    fn rewind(&mut self) -> Vec<u32> {
        let k = self.buffered.len();
        let keep = self.history.len().saturating_sub(k);
        self.history.truncate(keep);
        self.history.extend(self.buffered.iter().map(|p| p.token));
        let tail = self.predictions.len().saturating_sub(k);
        for (slot, own) in self.predictions[tail..].iter_mut().zip(&self.buffered) {
            *slot = *own;
        }
        self.buffered.clear();
        self.history.clone()
    }

    /// Consume one decoder step.
    pub fn step(&mut self, tokenizer: &dyn TextTokenizer, c: Candidates<'_>) -> Result<Action> {
        if matches!(self.state, MatchState::Abandoned) {
            return Ok(Action::Stop);
        }
        let eot = self.rules.eot;
        let confirmed = self.is_confirmed();

        let mut accepted = false;
        let mut string_hit = false;
        if !confirmed {
            if !self.rules.exact_token {
                string_hit = self.string_match(tokenizer, c.best_non_eot)?;
            }
            let expected = self.rules.target[self.cursor];
            let target_prob = Self::prob_of(c.probs, expected);
            accepted = target_prob >= self.rules.probability_threshold
                || c.best_non_eot == expected
                || string_hit;
        }

        let mut replay: Option<Vec<u32>> = None;
        let mut stop = false;
        let chosen = if accepted {
            self.eot_run = 0;
            if string_hit {
                self.state = MatchState::Confirmed;
                Prediction {
                    token: c.best_non_eot,
                    prob: Some(Self::prob_of(c.probs, c.best_non_eot)),
                }
            } else {
                let expected = self.rules.target[self.cursor];
                if !self.buffered.is_empty() || c.best_non_eot != expected {
                    self.buffered.push(Prediction {
                        token: c.best_non_eot,
                        prob: Some(Self::prob_of(c.probs, c.best_non_eot)),
                    });
                    self.state = MatchState::BufferedMismatch;
                }
                self.cursor += 1;
                if self.cursor == self.rules.target.len() {
                    self.state = MatchState::Confirmed;
                }
                Prediction {
                    token: expected,
                    prob: Some(Self::prob_of(c.probs, expected)),
                }
            }
        } else {
            if !confirmed {
                if !self.buffered.is_empty() {
                    replay = Some(self.rewind());
                }
                self.cursor = 0;
                self.state = MatchState::Matching;
            }
            let mut token = c.best;
            if token == eot {
                if self.eot_run >= self.rules.max_eots || confirmed {
                    stop = true;
                } else {
                    self.eot_run += 1;
                    token = c.best_non_eot;
                }
            } else {
                self.eot_run = 0;
            }
            Prediction {
                token,
                prob: (token != eot).then(|| Self::prob_of(c.probs, token)),
            }
        };

        self.predictions.push(chosen);
        if self.predictions.len() > self.rules.max_tokens {
            stop = true;
        }
        if stop {
            if !self.is_confirmed() {
                self.state = MatchState::Abandoned;
            }
            return Ok(Action::Stop);
        }

        self.history.push(chosen.token);
        Ok(match replay {
            Some(_) => Action::Replay(self.history.clone()),
            None => Action::Feed(vec![chosen.token]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::stub::{VocabTokenizer, EOT};

    const PROMPT: [u32; 2] = [1001, 1005];

    fn tok() -> VocabTokenizer {
        VocabTokenizer::new(["red", "green", "blue", "sky"])
    }

    fn rules(tok: &VocabTokenizer, phrase: &str, exact: bool) -> MatchRules {
        MatchRules {
            target: tok.encode(phrase).unwrap(),
            target_text: phrase.to_lowercase(),
            exact_token: exact,
            case_sensitive: false,
            probability_threshold: 0.5,
            max_eots: 1,
            max_tokens: 20,
            eot: EOT,
        }
    }

    /// Probabilities with `mass` on `token`, the rest spread evenly.
    fn probs(token: u32, mass: f32) -> Vec<f32> {
        let n = EOT as usize;
        let rest = (1.0 - mass) / (n - 1) as f32;
        let mut p = vec![rest; n];
        p[token as usize] = mass;
        p
    }

    fn step(m: &mut PhraseMatcher, tok: &VocabTokenizer, best: u32, non_eot: u32, p: &[f32]) -> Action {
        m.step(
            tok,
            Candidates {
                best,
                best_non_eot: non_eot,
                probs: p,
            },
        )
        .unwrap()
    }

    #[test]
    fn exact_sequence_confirms() {
        let tok = tok();
        let (green, blue) = (tok.id_of(" green").unwrap(), tok.id_of(" blue").unwrap());
        let mut m = PhraseMatcher::new(rules(&tok, " green blue", true), &PROMPT);
        assert_eq!(step(&mut m, &tok, green, green, &probs(green, 0.9)), Action::Feed(vec![green]));
        assert_eq!(m.state(), MatchState::Matching);
        assert_eq!(step(&mut m, &tok, blue, blue, &probs(blue, 0.9)), Action::Feed(vec![blue]));
        assert!(m.is_confirmed());
        assert_eq!(step(&mut m, &tok, EOT, green, &probs(green, 0.1)), Action::Stop);
        assert!(m.is_confirmed());
        let tokens: Vec<_> = m.predictions().iter().map(|p| p.token).collect();
        assert_eq!(tokens, vec![green, blue, EOT]);
    }

    #[test]
    fn forced_token_is_buffered_then_rewound() {
        let tok = tok();
        let (red, green, blue, sky) = (
            tok.id_of(" red").unwrap(),
            tok.id_of(" green").unwrap(),
            tok.id_of(" blue").unwrap(),
            tok.id_of(" sky").unwrap(),
        );
        let mut m = PhraseMatcher::new(rules(&tok, " green blue", true), &PROMPT);
        // decoder prefers " red" but " green" clears the threshold: forced
        let mut p = probs(red, 0.3);
        p[green as usize] = 0.6;
        assert_eq!(step(&mut m, &tok, red, red, &p), Action::Feed(vec![green]));
        assert_eq!(m.state(), MatchState::BufferedMismatch);
        assert_eq!(m.cursor(), 1);
        // next step does not support " blue": rewind to " red", then " sky"
        let action = step(&mut m, &tok, sky, sky, &probs(sky, 0.9));
        assert_eq!(action, Action::Replay(vec![PROMPT[0], PROMPT[1], red, sky]));
        assert_eq!(m.state(), MatchState::Matching);
        assert_eq!(m.cursor(), 0);
        let tokens: Vec<_> = m.predictions().iter().map(|p| p.token).collect();
        assert_eq!(tokens, vec![red, sky]);
        assert!(!tokens.contains(&blue));
    }

    #[test]
    fn string_mode_matches_case_insensitively() {
        let tok = VocabTokenizer::new(["Blue", "sky"]);
        let (blue, sky) = (tok.id_of(" Blue").unwrap(), tok.id_of(" sky").unwrap());
        let mut r = rules(&tok, " Blue sky", false);
        r.target_text = " blue sky".into();
        r.probability_threshold = 0.99;
        let mut m = PhraseMatcher::new(r, &PROMPT);
        assert_eq!(step(&mut m, &tok, blue, blue, &probs(blue, 0.7)), Action::Feed(vec![blue]));
        assert_eq!(step(&mut m, &tok, sky, sky, &probs(sky, 0.7)), Action::Feed(vec![sky]));
        assert!(m.is_confirmed());
    }

    #[test]
    fn eot_limit_abandons() {
        let tok = tok();
        let red = tok.id_of(" red").unwrap();
        let mut m = PhraseMatcher::new(rules(&tok, " green", true), &PROMPT);
        // first eot tolerated and replaced by the runner-up
        assert_eq!(step(&mut m, &tok, EOT, red, &probs(red, 0.2)), Action::Feed(vec![red]));
        assert_eq!(step(&mut m, &tok, EOT, red, &probs(red, 0.2)), Action::Stop);
        assert_eq!(m.state(), MatchState::Abandoned);
    }

    #[test]
    fn token_cap_abandons() {
        let tok = tok();
        let red = tok.id_of(" red").unwrap();
        let mut r = rules(&tok, " green", true);
        r.max_tokens = 2;
        let mut m = PhraseMatcher::new(r, &PROMPT);
        for _ in 0..2 {
            assert!(matches!(step(&mut m, &tok, red, red, &probs(red, 0.9)), Action::Feed(_)));
        }
        assert_eq!(step(&mut m, &tok, red, red, &probs(red, 0.9)), Action::Stop);
        assert_eq!(m.state(), MatchState::Abandoned);
    }
}
