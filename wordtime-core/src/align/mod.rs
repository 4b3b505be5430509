//! Windowing controller: forced alignment of known text to audio.
//!
//! ```text
//! queue of words ──► token-budget prefix ──► extractor(window at seek)
//!      ▲                                           │
//!      └──── unresolved trailing words ◄───────────┤
//!                                                  ▼
//!                             confirmed words, seek = last confirmed end
//! ```
//!
//! A word the extractor returns with zero duration could not be placed in
//! the current window; it goes back on the queue and is retried from the
//! next window, which starts where the last confirmed word ended.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::audio::{pad_or_trim, secs_to_samples};
use crate::config::AlignOptions;
use crate::error::{Result, WordtimeError};
use crate::inference::SequenceModel;
use crate::partition::take_token_budget;
use crate::progress::Progress;
use crate::text::{is_space_delimited, normalize_language, split_word_tokens, TextTokenizer, WordTokens};
use crate::timing::{ExtractRequest, TimestampExtractor};
use crate::transcript::{round_ms, Transcript, Word};

/// What to align.
#[derive(Debug, Clone, Copy)]
pub enum AlignInput<'a> {
    /// Plain text; whitespace is normalized to single spaces.
    Text(&'a str),
    /// Pre-tokenized text.
    Tokens(&'a [u32]),
    /// An existing transcript; its language and tokens are reused.
    Transcript(&'a Transcript),
}

enum Source {
    Text(String),
    Tokens(Vec<u32>),
}

struct Prepared {
    source: Source,
    language: Option<String>,
    /// Cumulative character counts at which the caller's segments end.
    split_chars: Vec<usize>,
}

fn normalize_text(text: &str) -> String {
    let spaced: String = text
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .collect();
    if spaced.starts_with(' ') {
        spaced
    } else {
        format!(" {spaced}")
    }
}

fn cumulative(lengths: impl IntoIterator<Item = usize>) -> Vec<usize> {
    lengths
        .into_iter()
        .scan(0usize, |acc, n| {
            *acc += n;
            Some(*acc)
        })
        .collect()
}

fn prepare(input: AlignInput<'_>, opts: &AlignOptions) -> Prepared {
    match input {
        AlignInput::Text(text) => {
            if opts.original_split && text.contains('\n') {
                let lines: Vec<String> = text.lines().map(normalize_text).collect();
                Prepared {
                    split_chars: cumulative(lines.iter().map(|l| l.chars().count())),
                    source: Source::Text(lines.concat()),
                    language: opts.language.clone(),
                }
            } else {
                Prepared {
                    source: Source::Text(normalize_text(text)),
                    language: opts.language.clone(),
                    split_chars: Vec::new(),
                }
            }
        }
        AlignInput::Tokens(tokens) => Prepared {
            source: Source::Tokens(tokens.to_vec()),
            language: opts.language.clone(),
            split_chars: Vec::new(),
        },
        AlignInput::Transcript(transcript) => {
            let split_chars = if opts.original_split
                && transcript.segments.len() > 1
                && transcript.has_words()
            {
                cumulative(
                    transcript
                        .segments
                        .iter()
                        .map(|s| s.words.iter().map(|w| w.text.chars().count()).sum()),
                )
            } else {
                Vec::new()
            };
            let tokenized = transcript.has_words() && transcript.words().all(|w| !w.tokens.is_empty());
            let source = if tokenized {
                Source::Tokens(transcript.words().flat_map(|w| w.tokens.iter().copied()).collect())
            } else {
                Source::Text(transcript.text())
            };
            Prepared {
                source,
                language: opts.language.clone().or_else(|| transcript.language.clone()),
                split_chars,
            }
        }
    }
}

/// Push trailing unresolved words of one window back onto the queue.
///
/// Trailing zero-duration words are unresolved. When words remain pending
/// afterwards, the last confirmed word goes back too so it is re-timed with
/// the context that follows it, unless it is the only word the window
/// confirmed.
fn requeue_unresolved(words: &mut Vec<Word>, queue: &mut VecDeque<WordTokens>) {
    fn pending(w: Word) -> WordTokens {
        WordTokens {
            text: w.text,
            tokens: w.tokens,
        }
    }
    while words.last().is_some_and(Word::is_instant) {
        if let Some(w) = words.pop() {
            queue.push_front(pending(w));
        }
    }
    if !queue.is_empty() && words.len() > 1 {
        if let Some(w) = words.pop() {
            queue.push_front(pending(w));
        }
    }
}

/// Indices after which a new segment starts, given cumulative character
/// counts of the caller's segments.
fn split_positions(words: &[Word], split_chars: &[usize]) -> Vec<usize> {
    let word_ends = cumulative(words.iter().map(|w| w.text.chars().count()));
    split_chars
        .iter()
        .filter_map(|&boundary| word_ends.iter().position(|&n| n >= boundary).map(|i| i + 1))
        .collect()
}

/// Align text to `audio` (mono samples at the model's sample rate).
///
/// Returns `Ok(None)` with a warning when no word could be aligned.
#[allow(clippy::too_many_arguments)]
pub fn align(
    model: &mut dyn SequenceModel,
    tokenizer: &dyn TextTokenizer,
    extractor: &mut dyn TimestampExtractor,
    audio: &[f32],
    input: AlignInput<'_>,
    opts: &AlignOptions,
    progress: &mut Progress<'_>,
) -> Result<Option<Transcript>> {
    let dims = model.dims().clone();
    let token_step = opts.effective_token_step(dims.max_text_tokens())?;

    let prepared = prepare(input, opts);
    let language = normalize_language(
        prepared
            .language
            .as_deref()
            .ok_or(WordtimeError::MissingLanguage)?,
    )?;

    let tokens = match prepared.source {
        Source::Text(text) => tokenizer.encode(&text)?,
        Source::Tokens(tokens) => tokens,
    };
    let eot = tokenizer.eot();
    let tokens: Vec<u32> = tokens.into_iter().filter(|&t| t < eot).collect();
    let mut queue: VecDeque<WordTokens> =
        split_word_tokens(&tokens, tokenizer, is_space_delimited(&language))?.into();

    let sr = dims.sample_rate;
    let total_samples = audio.len();
    let total_tokens = tokens.len() as f64;
    let mut finished_tokens = 0usize;
    let mut seek = 0usize;
    let mut aligned: Vec<Word> = Vec::new();

    info!(
        words = queue.len(),
        tokens = tokens.len(),
        token_step,
        language = %language,
        "aligning"
    );

    while !queue.is_empty() && seek < total_samples {
        let batch = take_token_budget(&mut queue, token_step);
        let window = &audio[seek..(seek + dims.n_samples()).min(total_samples)];
        let time_offset = seek as f64 / sr as f64;

        let mel = model.log_mel(window, dims.sample_padding())?;
        let mel = pad_or_trim(mel.view(), dims.n_frames());
        let request = ExtractRequest {
            mel: mel.view(),
            words: &batch,
            num_samples: window.len(),
            time_offset,
            language: &language,
        };
        let mut words = extractor.extract(model, tokenizer, &request)?;
        requeue_unresolved(&mut words, &mut queue);

        finished_tokens += words.iter().map(|w| w.tokens.len()).sum::<usize>();
        seek = match words.last() {
            Some(last) => secs_to_samples(last.end, sr).max(seek + 1),
            None => seek + window.len(),
        };

        for w in &words {
            if opts.verbose {
                info!(start = w.start, end = w.end, word = %w.text, "aligned");
            } else {
                debug!(start = w.start, end = w.end, word = %w.text, "aligned");
            }
        }
        aligned.extend(words);
        progress.report(finished_tokens as f64, total_tokens)?;
    }

    if aligned.is_empty() {
        warn!("failed to align text");
    }
    if !queue.is_empty() && !opts.remove_instant_words {
        let total_duration = round_ms(total_samples as f64 / sr as f64);
        debug!(unresolved = queue.len(), "stamping leftovers at end of audio");
        aligned.extend(queue.into_iter().map(|w| {
            Word::new(w.text, w.tokens, total_duration, total_duration).with_probability(0.0)
        }));
    }
    progress.report(total_tokens, total_tokens)?;

    if aligned.is_empty() {
        return Ok(None);
    }
    let split_after = split_positions(&aligned, &prepared.split_chars);
    Ok(Some(Transcript::from_words(Some(language), aligned, &split_after)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Segment;

    fn wt(text: &str) -> WordTokens {
        WordTokens {
            text: text.into(),
            tokens: vec![1],
        }
    }

    fn word(text: &str, start: f64, end: f64) -> Word {
        Word::new(text, vec![1], start, end)
    }

    #[test]
    fn text_is_normalized_with_leading_space() {
        assert_eq!(normalize_text("a\tb\nc"), " a b c");
        assert_eq!(normalize_text(" x"), " x");
    }

    #[test]
    fn trailing_instant_words_and_last_confirmed_are_requeued() {
        let mut words = vec![
            word(" a", 0.0, 1.0),
            word(" b", 1.0, 2.0),
            word(" c", 2.0, 2.0),
        ];
        let mut queue: VecDeque<_> = [wt(" d")].into_iter().collect();
        requeue_unresolved(&mut words, &mut queue);
        assert_eq!(words.len(), 1);
        let texts: Vec<_> = queue.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec![" b", " c", " d"]);
    }

    #[test]
    fn nothing_is_requeued_at_end_of_text() {
        let mut words = vec![word(" a", 0.0, 1.0), word(" b", 1.0, 2.0)];
        let mut queue = VecDeque::new();
        requeue_unresolved(&mut words, &mut queue);
        assert_eq!(words.len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn a_single_confirmed_word_is_kept() {
        let mut words = vec![word(" a", 0.0, 1.0), word(" b", 1.0, 1.0)];
        let mut queue = VecDeque::new();
        requeue_unresolved(&mut words, &mut queue);
        assert_eq!(words.len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn original_split_follows_lines() {
        let opts = AlignOptions {
            original_split: true,
            language: Some("en".into()),
            ..Default::default()
        };
        let prepared = prepare(AlignInput::Text("one two\nthree"), &opts);
        assert_eq!(prepared.split_chars, vec![8, 14]);
        let words = vec![word(" one", 0.0, 1.0), word(" two", 1.0, 2.0), word(" three", 2.0, 3.0)];
        assert_eq!(split_positions(&words, &prepared.split_chars), vec![2, 3]);
    }

    #[test]
    fn transcript_input_reuses_language_and_tokens() {
        let transcript = Transcript {
            language: Some("de".into()),
            segments: vec![Segment::new(0, vec![Word::new(" hallo", vec![4, 5], 0.0, 1.0)])],
        };
        let prepared = prepare(AlignInput::Transcript(&transcript), &AlignOptions::default());
        assert_eq!(prepared.language.as_deref(), Some("de"));
        assert!(matches!(prepared.source, Source::Tokens(ref t) if t == &vec![4, 5]));
    }
}
