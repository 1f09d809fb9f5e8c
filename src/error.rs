/// Result type for moderation operations
pub type Result<T> = std::result::Result<T, ModerationError>;

/// Error types for the moderation pipeline and its collaborators
#[derive(thiserror::Error, Debug)]
pub enum ModerationError {
    /// Video metadata is unusable (missing stream, frame rate <= 0, ...)
    #[error("Invalid video source: {0}")]
    InvalidSource(String),

    /// A frame could not be read mid-stream
    #[error("Decode error after frame {last_index:?}: {message}")]
    Decode {
        message: String,
        last_index: Option<u64>,
    },

    /// A single remote classification call failed
    #[error("Classifier error: {0}")]
    Classifier(String),

    /// The classifier cannot be used at all (e.g. credentials rejected)
    #[error("Classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    /// Temporary frame storage could not be written or removed
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Video produced no frames")]
    NoFrames,

    #[error("Pipeline cancelled after frame {last_index:?}")]
    Cancelled { last_index: Option<u64> },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModerationError {
    /// Whether this error ends the whole pipeline rather than a single frame
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Classifier(_) | Self::Storage(_))
    }
}

/// Decode failure that cut a video short but left usable frames behind
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DecodeWarning {
    pub message: String,
    pub last_index: Option<u64>,
}
