//! Error types for minitask.
//!
//! Configuration problems are fatal and surface immediately. Stage failures
//! carry the index and label of the stage that failed. A cache miss caused by
//! a changed input file is never an error.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = MinitaskError> = std::result::Result<T, E>;

/// The main error type for minitask operations.
#[derive(Debug, Error)]
pub enum MinitaskError {
    /// The caller supplied an unusable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The on-disk cache index could not be parsed.
    #[error(
        "Cache index {} is corrupt ({reason}). Delete the cache directory {} and run again to rebuild it.",
        path.display(),
        cache_dir.display()
    )]
    CorruptIndex {
        /// Path of the index file.
        path: PathBuf,
        /// Directory that must be deleted.
        cache_dir: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// A stage reported a failure.
    #[error("Stage {index} ({label}) failed: {source:#}")]
    StageFailed {
        /// Position of the stage in the pipeline.
        index: usize,
        /// Human label of the stage.
        label: String,
        /// The underlying failure.
        #[source]
        source: anyhow::Error,
    },

    /// An operation exceeded its configured deadline.
    #[error("{what} timed out after {after_ms}ms")]
    Timeout {
        /// What was being waited on.
        what: String,
        /// The configured deadline.
        after_ms: u128,
    },

    /// The work was abandoned before it completed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A spawned task could not be joined.
    #[error("Task join error: {0}")]
    Join(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl MinitaskError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates a stage failure.
    #[must_use]
    pub fn stage(index: usize, label: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::StageFailed {
            index,
            label: label.into(),
            source: source.into(),
        }
    }

    /// Returns true for errors that indicate a misconfiguration rather than a
    /// failure of the work itself.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::CorruptIndex { .. })
    }
}

/// Returns true when an I/O error only means the reading side went away.
///
/// A consumer that stops reading early (e.g. `head`) closes its end of the
/// pipe; writes into it then fail with `BrokenPipe`, which is expected.
#[must_use]
pub fn is_broken_pipe(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}
