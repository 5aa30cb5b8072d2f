use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown project: {0}")]
    UnknownProject(String),

    #[error("Operation failed: {0}")]
    Operation(String),

    /// Every embedding backend in the chain failed for a batch.
    #[error("Embedding backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Persisted index files failed to parse or disagree with each other.
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Lexical index error: {0}")]
    Lexical(String),

    #[error("Rebuild in progress for project {0}")]
    RebuildInProgress(String),

    #[error("Rebuild cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn lexical(err: impl std::fmt::Display) -> Self {
        Self::Lexical(err.to_string())
    }

    pub fn corrupt(err: impl std::fmt::Display) -> Self {
        Self::CorruptIndex(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
