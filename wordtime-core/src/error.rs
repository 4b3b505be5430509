use thiserror::Error;

/// All errors produced by wordtime-core.
#[derive(Debug, Error)]
pub enum WordtimeError {
    #[error("invalid refinement step(s) {steps:?}: only 's' (start) and 'e' (end) are allowed")]
    InvalidSteps { steps: String },

    #[error("token_step {requested} exceeds the model maximum of {max}")]
    TokenStepTooLarge { requested: usize, max: usize },

    #[error("no language given and none can be derived from the input")]
    MissingLanguage,

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("transcript has no word-level timestamps")]
    MissingWordTimestamps,

    #[error("inference error: {0}")]
    Inference(String),

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("audio decode error: {0}")]
    AudioDecode(String),

    #[error("cancelled by caller")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, WordtimeError>;
