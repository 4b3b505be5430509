#[cfg(not(feature = "onnx"))]
fn main() {
    eprintln!("wordtime-report requires the 'onnx' feature");
    std::process::exit(1);
}

#[cfg(feature = "onnx")]
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("wordtime-report failed: {e}");
        std::process::exit(1);
    }
}

#[cfg(feature = "onnx")]
fn run() -> Result<(), String> {
    use serde::Serialize;
    use std::path::{Path, PathBuf};
    use std::time::Instant;
    use wordtime_core::{
        audio::AudioClip, AlignInput, EngineConfig, LocateMatch, LocateTarget, OnnxWhisper,
        OnnxWhisperConfig, SequenceModel, TimingEngine, Transcript, WhisperTokenizer,
    };

    #[derive(Debug)]
    struct Args {
        audio: PathBuf,
        text: Option<PathBuf>,
        refine: bool,
        locate: Option<String>,
        language: String,
        options: Option<PathBuf>,
        model_dir: Option<PathBuf>,
        output: Option<PathBuf>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Timings {
        align_ms: Option<f64>,
        refine_ms: Option<f64>,
        locate_ms: Option<f64>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Report {
        audio: String,
        duration_secs: f64,
        language: String,
        aligned: Option<Transcript>,
        refined: Option<Transcript>,
        matches: Vec<LocateMatch>,
        timings: Timings,
    }

    const USAGE: &str = "Usage: cargo run -p wordtime-core --features onnx --bin wordtime-report -- \\
  --audio <file.wav> [--text <file.txt>] [--refine] [--locate <phrase>] \\
  [--language <code>] [--options <options.json>] [--model-dir <dir>] [--output <file.json>]";

    fn parse_args() -> Result<Args, String> {
        let mut audio: Option<PathBuf> = None;
        let mut text: Option<PathBuf> = None;
        let mut refine = false;
        let mut locate: Option<String> = None;
        let mut language = "en".to_string();
        let mut options: Option<PathBuf> = None;
        let mut model_dir: Option<PathBuf> = None;
        let mut output: Option<PathBuf> = None;

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            let mut value = |flag: &str| it.next().ok_or_else(|| format!("missing value for {flag}"));
            match arg.as_str() {
                "--audio" => audio = Some(PathBuf::from(value("--audio")?)),
                "--text" => text = Some(PathBuf::from(value("--text")?)),
                "--refine" => refine = true,
                "--locate" => locate = Some(value("--locate")?),
                "--language" => language = value("--language")?,
                "--options" => options = Some(PathBuf::from(value("--options")?)),
                "--model-dir" => model_dir = Some(PathBuf::from(value("--model-dir")?)),
                "--output" => output = Some(PathBuf::from(value("--output")?)),
                "--help" | "-h" => {
                    println!("{USAGE}");
                    std::process::exit(0);
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }

        let audio = audio.ok_or_else(|| format!("--audio is required\n{USAGE}"))?;
        if refine && text.is_none() {
            return Err("--refine needs --text to align first".into());
        }
        Ok(Args {
            audio,
            text,
            refine,
            locate,
            language,
            options,
            model_dir,
            output,
        })
    }

    fn elapsed_ms(start: Instant) -> f64 {
        (start.elapsed().as_secs_f64() * 1_000.0 * 10.0).round() / 10.0
    }

    fn write_report(report: &Report, output: Option<&Path>) -> Result<(), String> {
        let json = serde_json::to_string_pretty(report).map_err(|e| e.to_string())?;
        match output {
            Some(path) => std::fs::write(path, json).map_err(|e| e.to_string()),
            None => {
                println!("{json}");
                Ok(())
            }
        }
    }

    let args = parse_args()?;

    let model_config = match &args.model_dir {
        Some(dir) => OnnxWhisperConfig::from_dir(dir),
        None => OnnxWhisperConfig::default(),
    };
    let model = OnnxWhisper::load(&model_config).map_err(|e| e.to_string())?;
    let tokenizer =
        WhisperTokenizer::from_file(&model_config.tokenizer_path).map_err(|e| e.to_string())?;
    let sample_rate = model.dims().sample_rate;

    let mut config = match &args.options {
        Some(path) => EngineConfig::from_json_file(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    config.align.language.get_or_insert_with(|| args.language.clone());

    let clip = AudioClip::from_wav(&args.audio)
        .and_then(|c| c.into_rate(sample_rate))
        .map_err(|e| e.to_string())?;
    tracing::info!(
        path = %args.audio.display(),
        duration_secs = clip.duration_secs(),
        "audio loaded"
    );

    let mut engine = TimingEngine::new(Box::new(model), Box::new(tokenizer)).with_config(config);
    let mut timings = Timings {
        align_ms: None,
        refine_ms: None,
        locate_ms: None,
    };

    let mut aligned = None;
    if let Some(path) = &args.text {
        let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let start = Instant::now();
        aligned = engine
            .align(&clip.samples, AlignInput::Text(&text))
            .map_err(|e| e.to_string())?;
        timings.align_ms = Some(elapsed_ms(start));
    }

    let mut refined = None;
    if args.refine {
        if let Some(transcript) = &aligned {
            let start = Instant::now();
            refined = Some(
                engine
                    .refined(&clip.samples, transcript)
                    .map_err(|e| e.to_string())?,
            );
            timings.refine_ms = Some(elapsed_ms(start));
        }
    }

    let mut matches = Vec::new();
    if let Some(phrase) = &args.locate {
        let start = Instant::now();
        matches = engine
            .locate(&clip.samples, LocateTarget::Text(phrase), &args.language)
            .map_err(|e| e.to_string())?;
        timings.locate_ms = Some(elapsed_ms(start));
    }

    let report = Report {
        audio: args.audio.display().to_string(),
        duration_secs: clip.duration_secs(),
        language: args.language.clone(),
        aligned,
        refined,
        matches,
        timings,
    };
    write_report(&report, args.output.as_deref())
}
