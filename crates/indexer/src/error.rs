use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexerError>;

/// Stage of [`crate::PendingFileCompleter::complete`] that reported failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStage {
    Deleting,
    Renaming,
}

impl std::fmt::Display for CompletionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deleting => f.write_str("deleting"),
            Self::Renaming => f.write_str("renaming"),
        }
    }
}

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    ConfigError(#[from] toml::de::Error),

    #[error("Invalid ignore pattern: {0}")]
    PatternError(#[from] globset::Error),

    #[error("Thread pool error: {0}")]
    ThreadPoolError(#[from] rayon::ThreadPoolBuildError),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Index is locked by another writer: {}", path.display())]
    LockHeld { path: PathBuf },

    #[error("Worker pool is shut down")]
    PoolClosed,

    #[error("Ctags error: {0}")]
    CtagsError(String),

    #[error("{failures} failures ({:.1}%) while {stage} pending files", percent(.failures, .total))]
    Completion {
        stage: CompletionStage,
        failures: usize,
        total: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Whether the error means another writer owns the index directory.
    #[must_use]
    pub fn is_lock_held(&self) -> bool {
        matches!(self, Self::LockHeld { .. })
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(part: &usize, total: &usize) -> f64 {
    if *total == 0 {
        return 0.0;
    }
    100.0 * *part as f64 / *total as f64
}
