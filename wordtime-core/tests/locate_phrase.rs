mod common;

use common::{approx_eq, ScriptedExtractor};
use wordtime_core::{
    inference::stub::{ScriptedModel, ScriptedToken},
    locate,
    text::stub::VocabTokenizer,
    AttentionAligner, LocateMatch, LocateMode, LocateOptions, LocateTarget, Progress,
    WordtimeError,
};

/// alpha, beta, gamma, delta spoken back to back in six seconds of audio.
fn scene(extra_vocab: &[&str]) -> (VocabTokenizer, ScriptedModel, Vec<f32>) {
    let mut vocab = vec!["alpha", "beta", "gamma", "delta"];
    vocab.extend_from_slice(extra_vocab);
    let tok = VocabTokenizer::new(vocab);
    let id = |w: &str| tok.id_of(&format!(" {w}")).unwrap();
    let model = ScriptedModel::new(vec![
        ScriptedToken::new(id("alpha"), 0.5, 0.9),
        ScriptedToken::new(id("beta"), 1.0, 1.4),
        ScriptedToken::new(id("gamma"), 1.6, 2.0),
        ScriptedToken::new(id("delta"), 2.1, 2.4),
    ]);
    let audio = model.render(6.0);
    (tok, model, audio)
}

fn opts(mode: LocateMode) -> LocateOptions {
    LocateOptions {
        mode,
        exact_token: true,
        ..Default::default()
    }
}

#[test]
fn confirm_mode_reports_the_decoded_window() {
    let (tok, mut model, audio) = scene(&[]);
    let mut extractor = ScriptedExtractor::default();

    let found = locate(
        &mut model,
        &tok,
        &mut extractor,
        &audio,
        LocateTarget::Text(" gamma delta"),
        "en",
        &opts(LocateMode::Confirm),
        &mut Progress::silent(),
    )
    .unwrap();

    assert_eq!(found.len(), 1);
    match &found[0] {
        LocateMatch::Confirmed {
            end,
            window_text,
            window_words,
            ..
        } => {
            assert!(approx_eq(*end, 2.4, 1e-9));
            assert_eq!(window_text, " alpha beta gamma delta");
            assert_eq!(window_words.len(), 4);
            assert!(window_words.iter().all(|w| w.probability > 0.5));
        }
        other => panic!("expected a confirmed match, got {other:?}"),
    }
    assert!(extractor.seen.is_empty());
}

#[test]
fn coarse_only_skips_decoding() {
    let (tok, mut model, audio) = scene(&[]);
    let mut extractor = ScriptedExtractor::default();

    let found = locate(
        &mut model,
        &tok,
        &mut extractor,
        &audio,
        LocateTarget::Text(" gamma delta"),
        "en",
        &opts(LocateMode::CoarseOnly),
        &mut Progress::silent(),
    )
    .unwrap();

    assert_eq!(found, vec![LocateMatch::Unconfirmed { end: 2.4 }]);
}

#[test]
fn transcribe_mode_times_the_window_words() {
    let (tok, mut model, audio) = scene(&[]);
    let mut extractor = AttentionAligner::default();

    let found = locate(
        &mut model,
        &tok,
        &mut extractor,
        &audio,
        LocateTarget::Text(" gamma delta"),
        "en",
        &opts(LocateMode::Transcribe),
        &mut Progress::silent(),
    )
    .unwrap();

    assert_eq!(found.len(), 1);
    let LocateMatch::Transcribed { segment } = &found[0] else {
        panic!("expected a transcribed match, got {:?}", found[0]);
    };
    assert_eq!(segment.words.len(), 4);
    assert!(segment
        .words
        .windows(2)
        .all(|w| w[0].start <= w[1].start && w[0].end <= w[1].end));
    let end = segment.end().unwrap();
    assert!((1.9..=2.5).contains(&end), "phrase ended at {end}");
}

#[test]
fn absent_phrase_finds_nothing() {
    let (tok, mut model, audio) = scene(&["omega"]);
    let mut extractor = ScriptedExtractor::default();

    let found = locate(
        &mut model,
        &tok,
        &mut extractor,
        &audio,
        LocateTarget::Text(" omega"),
        "en",
        &opts(LocateMode::Confirm),
        &mut Progress::silent(),
    )
    .unwrap();

    assert!(found.is_empty());
}

#[test]
fn empty_phrase_is_rejected() {
    let (tok, mut model, audio) = scene(&[]);
    let mut extractor = ScriptedExtractor::default();
    let err = locate(
        &mut model,
        &tok,
        &mut extractor,
        &audio,
        LocateTarget::Tokens(&[]),
        "en",
        &LocateOptions::default(),
        &mut Progress::silent(),
    )
    .unwrap_err();
    assert!(matches!(err, WordtimeError::InvalidOption(_)));
}

#[test]
fn oversized_duration_window_is_rejected() {
    let (tok, mut model, audio) = scene(&[]);
    let mut extractor = ScriptedExtractor::default();
    let err = locate(
        &mut model,
        &tok,
        &mut extractor,
        &audio,
        LocateTarget::Text(" gamma"),
        "en",
        &LocateOptions {
            duration_window: wordtime_core::DurationWindow::Symmetric(15.0),
            ..Default::default()
        },
        &mut Progress::silent(),
    )
    .unwrap_err();
    assert!(matches!(err, WordtimeError::InvalidOption(_)));
    assert_eq!(model.forward_calls(), 0);
}

/// The same four words spoken twice, forty seconds apart.
fn repeated_scene() -> (VocabTokenizer, ScriptedModel, Vec<f32>) {
    let tok = VocabTokenizer::new(["alpha", "beta", "gamma", "delta"]);
    let id = |w: &str| tok.id_of(&format!(" {w}")).unwrap();
    let mut script = Vec::new();
    for offset in [0.0, 40.0] {
        script.extend([
            ScriptedToken::new(id("alpha"), offset + 0.5, offset + 0.9),
            ScriptedToken::new(id("beta"), offset + 1.0, offset + 1.4),
            ScriptedToken::new(id("gamma"), offset + 1.6, offset + 2.0),
            ScriptedToken::new(id("delta"), offset + 2.1, offset + 2.4),
        ]);
    }
    let model = ScriptedModel::new(script);
    let audio = model.render(45.0);
    (tok, model, audio)
}

fn ends(found: &[LocateMatch]) -> Vec<f64> {
    found.iter().filter_map(LocateMatch::end).collect()
}

fn run(opts: &LocateOptions, phrase: &str) -> Vec<LocateMatch> {
    let (tok, mut model, audio) = repeated_scene();
    let mut extractor = ScriptedExtractor::default();
    locate(
        &mut model,
        &tok,
        &mut extractor,
        &audio,
        LocateTarget::Text(phrase),
        "en",
        opts,
        &mut Progress::silent(),
    )
    .unwrap()
}

#[test]
fn unbounded_count_finds_every_occurrence() {
    for exact_token in [false, true] {
        let found = run(
            &LocateOptions {
                mode: LocateMode::Confirm,
                count: 0,
                exact_token,
                ..Default::default()
            },
            " gamma delta",
        );
        assert_eq!(ends(&found), vec![2.4, 42.4], "exact_token = {exact_token}");
        assert!(found
            .iter()
            .all(|m| matches!(m, LocateMatch::Confirmed { .. })));
    }
}

#[test]
fn text_matching_is_the_default() {
    let defaults = LocateOptions::default();
    assert!(!defaults.exact_token);
    let found = run(
        &LocateOptions {
            mode: LocateMode::Confirm,
            ..defaults
        },
        " gamma delta",
    );
    assert_eq!(ends(&found), vec![2.4]);
    match &found[0] {
        LocateMatch::Confirmed { text, .. } => assert_eq!(text, " gamma delta"),
        other => panic!("expected a confirmed match, got {other:?}"),
    }
}

#[test]
fn count_stops_the_search_early() {
    let found = run(
        &LocateOptions {
            mode: LocateMode::Confirm,
            count: 1,
            ..Default::default()
        },
        " gamma delta",
    );
    assert_eq!(ends(&found), vec![2.4]);
}

#[test]
fn coarse_only_respects_the_count_cap() {
    let capped = run(
        &LocateOptions {
            mode: LocateMode::CoarseOnly,
            count: 1,
            ..Default::default()
        },
        " gamma delta",
    );
    assert_eq!(ends(&capped), vec![2.4]);

    // Unbounded estimates cover the whole audio; the later window that
    // holds no phrase repeats the earlier end rather than inventing one.
    let unbounded = run(
        &LocateOptions {
            mode: LocateMode::CoarseOnly,
            count: 0,
            ..Default::default()
        },
        " gamma delta",
    );
    let got = ends(&unbounded);
    assert_eq!(got.first(), Some(&2.4));
    assert_eq!(got.last(), Some(&42.4));
    assert!(unbounded
        .iter()
        .all(|m| matches!(m, LocateMatch::Unconfirmed { .. })));
}
