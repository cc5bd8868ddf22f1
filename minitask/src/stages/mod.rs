//! Stage variants and their constructors.
//!
//! A pipeline is a list of [`Stage`]s. Each stage is explicitly tagged with
//! its execution model when it is built:
//!
//! - [`Stage::sync`]: a plain function from one blob to the next.
//! - [`Stage::async_fn`] / [`Stage::with_continuation`]: asynchronous transforms.
//! - [`Stage::streaming`]: an already-open [`StreamStage`] (single use).
//! - [`Stage::factory`] / [`Stage::command`]: a constructor that opens a
//!   [`StreamStage`] lazily, at the moment the pipeline wires it.

mod continuation;
mod stream;
mod transform;

pub use continuation::Continuation;
pub use stream::{BoxReader, BoxWriter, StageWorker, StreamStage};
pub use transform::ChunkTransform;

use crate::errors::{MinitaskError, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::process::Command;

/// A synchronous blob transform.
pub type SyncFn = Arc<dyn Fn(Vec<u8>) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// An asynchronous blob transform.
pub type AsyncFn =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, anyhow::Result<Vec<u8>>> + Send + Sync>;

/// A lazy constructor for a streaming stage.
pub type StreamFactory = Arc<dyn Fn() -> anyhow::Result<StreamStage> + Send + Sync>;

/// The execution model of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Consumes one value and returns one value.
    Sync,
    /// Consumes one value and resolves to one value later.
    Async,
    /// A writable side and a readable side with data in flight.
    Streaming,
    /// Produces a streaming stage on demand.
    StreamingFactory,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sync => "sync",
            Self::Async => "async",
            Self::Streaming => "streaming",
            Self::StreamingFactory => "streaming_factory",
        };
        write!(f, "{s}")
    }
}

/// One unit of transformation within a pipeline.
///
/// Stages are cheap to clone; a pipeline takes an owned copy of its stage
/// list so the same list can drive many independent runs. The exception is a
/// literal [`Stage::streaming`] stage: the underlying stream can only be wired
/// once, and a second run fails with a configuration error. Use
/// [`Stage::factory`] for streaming stages that must be reusable.
#[derive(Clone)]
pub enum Stage {
    /// A synchronous transform.
    Sync {
        /// Human label used in logs and errors.
        label: String,
        /// The transform.
        func: SyncFn,
    },
    /// An asynchronous transform.
    Async {
        /// Human label used in logs and errors.
        label: String,
        /// The transform.
        func: AsyncFn,
    },
    /// A streaming stage that is already open.
    Streaming {
        /// Human label used in logs and errors.
        label: String,
        /// Taken by the first run that wires the stage.
        slot: Arc<Mutex<Option<StreamStage>>>,
    },
    /// A constructor for a streaming stage.
    StreamingFactory {
        /// Human label used in logs and errors.
        label: String,
        /// Invoked once per run, when the stage is wired.
        factory: StreamFactory,
    },
}

/// A stage that is ready to execute in the current run.
pub(crate) enum Resolved {
    Sync(SyncFn),
    Async(AsyncFn),
    Stream(StreamStage),
}

impl Stage {
    /// Creates a synchronous stage.
    pub fn sync<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<u8>) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        Self::Sync {
            label: label.into(),
            func: Arc::new(func),
        }
    }

    /// Creates a synchronous stage over UTF-8 text.
    ///
    /// Input that is not valid UTF-8 fails the stage.
    pub fn map_text<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self::sync(label, move |input| {
            let text = String::from_utf8(input)?;
            Ok(func(&text).into_bytes())
        })
    }

    /// Creates an asynchronous stage from a function returning a future.
    pub fn async_fn<F, Fut>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
    {
        Self::Async {
            label: label.into(),
            func: Arc::new(move |input| Box::pin(func(input))),
        }
    }

    /// Creates an asynchronous stage in continuation style.
    ///
    /// The function receives the input and a [`Continuation`] which it must
    /// complete exactly once, possibly from another task. A continuation that
    /// is dropped without being completed fails the stage.
    pub fn with_continuation<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<u8>, Continuation) + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        Self::Async {
            label: label.into(),
            func: Arc::new(move |input| {
                let func = Arc::clone(&func);
                Box::pin(async move {
                    let (continuation, receiver) = Continuation::channel();
                    func(input, continuation);
                    receiver.await.unwrap_or_else(|_| {
                        Err(anyhow::anyhow!("continuation dropped without completing"))
                    })
                })
            }),
        }
    }

    /// Wraps an already-open streaming stage.
    #[must_use]
    pub fn streaming(stream: StreamStage) -> Self {
        Self::Streaming {
            label: stream.label().to_string(),
            slot: Arc::new(Mutex::new(Some(stream))),
        }
    }

    /// Creates a stage that opens its stream lazily.
    pub fn factory<F>(label: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<StreamStage> + Send + Sync + 'static,
    {
        Self::StreamingFactory {
            label: label.into(),
            factory: Arc::new(factory),
        }
    }

    /// Creates a stage that spawns an external process each time it runs.
    ///
    /// The process reads the stage input on stdin and produces the stage
    /// output on stdout. Its stderr goes to the host's stderr.
    pub fn command<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = program.into();
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let label = std::iter::once(program.clone())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");

        Self::factory(label, move || {
            let mut command = Command::new(&program);
            command.args(&args);
            Ok(StreamStage::spawn(command)?)
        })
    }

    /// Returns the label of the stage.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Sync { label, .. }
            | Self::Async { label, .. }
            | Self::Streaming { label, .. }
            | Self::StreamingFactory { label, .. } => label,
        }
    }

    /// Returns the execution model of the stage.
    #[must_use]
    pub const fn kind(&self) -> StageKind {
        match self {
            Self::Sync { .. } => StageKind::Sync,
            Self::Async { .. } => StageKind::Async,
            Self::Streaming { .. } => StageKind::Streaming,
            Self::StreamingFactory { .. } => StageKind::StreamingFactory,
        }
    }

    /// Returns true for stages that execute as streams once wired.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        matches!(self.kind(), StageKind::Streaming | StageKind::StreamingFactory)
    }

    /// Prepares the stage for execution at position `index`.
    ///
    /// Factories are invoked here, so the resources they open exist only
    /// from this point on.
    pub(crate) fn resolve(self, index: usize) -> Result<Resolved> {
        match self {
            Self::Sync { func, .. } => Ok(Resolved::Sync(func)),
            Self::Async { func, .. } => Ok(Resolved::Async(func)),
            Self::Streaming { label, slot } => slot.lock().take().map(Resolved::Stream).ok_or_else(|| {
                MinitaskError::config(format!(
                    "streaming stage {index} ({label}) was already consumed by an earlier run; \
                     use Stage::factory for streaming stages that are reused"
                ))
            }),
            Self::StreamingFactory { label, factory } => factory()
                .map(Resolved::Stream)
                .map_err(|err| MinitaskError::stage(index, label, err)),
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("label", &self.label())
            .field("kind", &self.kind())
            .finish()
    }
}
