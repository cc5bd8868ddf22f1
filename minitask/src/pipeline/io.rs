//! Pipeline inputs and outputs.

use crate::stages::{BoxReader, BoxWriter};
use std::fmt;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};

/// Receives the final value of a pipeline.
pub type OutputCallback = Box<dyn FnOnce(Vec<u8>) + Send>;

/// Where a pipeline reads its input from.
pub enum Input {
    /// An already-complete blob.
    Value(Vec<u8>),
    /// A streaming source. Nothing is read from it until the first stage has
    /// been wired, and it is handed to exactly one consumer.
    Reader(BoxReader),
    /// A file, opened only when the pipeline executes.
    File(PathBuf),
}

impl Input {
    /// Creates a streaming input.
    pub fn reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::Reader(Box::new(reader))
    }

    /// Creates a lazily-opened file input.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Self::Value(value.as_bytes().to_vec())
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Self::Value(value.into_bytes())
    }
}

impl From<Vec<u8>> for Input {
    fn from(value: Vec<u8>) -> Self {
        Self::Value(value)
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(&value.len()).finish(),
            Self::Reader(_) => f.write_str("Reader"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

/// Where a pipeline delivers its result.
pub enum Output {
    /// Receives the complete final value.
    Callback(OutputCallback),
    /// A streaming destination.
    Writer {
        /// The sink.
        sink: BoxWriter,
        /// Whether the pipeline shuts the sink down when it finishes. Sinks
        /// that outlive the pipeline (stdout, a combined output) must not be
        /// closed.
        close: bool,
    },
    /// A file, created (or truncated) and closed by the pipeline.
    File(PathBuf),
}

impl Output {
    /// Creates a callback output.
    pub fn callback<F>(callback: F) -> Self
    where
        F: FnOnce(Vec<u8>) + Send + 'static,
    {
        Self::Callback(Box::new(callback))
    }

    /// Creates a writer output owned by the pipeline; it is shut down at the end.
    pub fn writer<W>(sink: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::Writer {
            sink: Box::new(sink),
            close: true,
        }
    }

    /// Creates a writer output that is flushed but never shut down.
    pub fn shared_writer<W>(sink: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::Writer {
            sink: Box::new(sink),
            close: false,
        }
    }

    /// Creates a file output.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("Callback"),
            Self::Writer { close, .. } => f.debug_struct("Writer").field("close", close).finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}
