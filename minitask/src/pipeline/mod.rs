//! Pipeline construction and execution.
//!
//! This module provides:
//! - [`Pipeline`]: an ordered list of stages bound to one input and one output
//! - [`Input`] / [`Output`]: blob, stream and file endpoints
//! - [`PipelineOutcome`]: the value passed to the completion callback
//! - Deadlines for stages through [`PipelineConfig`]

mod engine;
mod io;
mod latch;
mod timeout;


pub use engine::{PipelineReport, PipelineState};
pub use io::{Input, Output, OutputCallback};
pub use latch::CompletionLatch;
pub use timeout::{with_deadline, PipelineConfig};

use crate::errors::{MinitaskError, Result};
use crate::stages::Stage;
use engine::Engine;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How a pipeline finished. Passed to the `on_done` callback exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// The stages ran and the output was delivered.
    Completed(PipelineReport),
    /// The stages were skipped; the result was replayed from this cached file.
    Cached(PathBuf),
    /// The pipeline failed or was dropped before finishing.
    Failed(String),
}

impl PipelineOutcome {
    /// Returns true unless the pipeline failed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// An ordered list of stages applied to one input, delivering to one output.
///
/// ```rust,ignore
/// let report = Pipeline::new(&[Stage::command("wc", ["-c"])])
///     .input("hello")
///     .output(Output::callback(|bytes| println!("{}", String::from_utf8_lossy(&bytes))))
///     .exec()
///     .await?;
/// ```
pub struct Pipeline {
    stages: Vec<Stage>,
    input: Option<Input>,
    output: Option<Output>,
    input_file: Option<PathBuf>,
    task_fingerprint: Option<String>,
    config: PipelineConfig,
    done: Option<Arc<CompletionLatch<PipelineOutcome>>>,
}

impl Pipeline {
    /// Creates a pipeline over a copy of `stages`.
    ///
    /// The caller's list is not modified and can build further pipelines.
    #[must_use]
    pub fn new(stages: &[Stage]) -> Self {
        Self {
            stages: stages.to_vec(),
            input: None,
            output: None,
            input_file: None,
            task_fingerprint: None,
            config: PipelineConfig::default(),
            done: None,
        }
    }

    /// Creates a pipeline that reads `path` and is tagged with it for caching.
    #[must_use]
    pub fn from_file(path: impl Into<PathBuf>, stages: &[Stage]) -> Self {
        let path = path.into();
        let mut pipeline = Self::new(stages).input(Input::File(path.clone()));
        pipeline.input_file = Some(path);
        pipeline
    }

    /// Sets the input.
    #[must_use]
    pub fn input(mut self, input: impl Into<Input>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Sets the output.
    #[must_use]
    pub fn output(mut self, output: Output) -> Self {
        self.output = Some(output);
        self
    }

    /// Tags the pipeline with the file it derives from and a fingerprint of
    /// the task it performs. Tagged pipelines are eligible for caching.
    #[must_use]
    pub fn tag(mut self, input_file: impl Into<PathBuf>, task_fingerprint: impl Into<String>) -> Self {
        self.input_file = Some(input_file.into());
        self.task_fingerprint = Some(task_fingerprint.into());
        self
    }

    /// Sets only the task fingerprint.
    #[must_use]
    pub fn with_task_fingerprint(mut self, task_fingerprint: impl Into<String>) -> Self {
        self.task_fingerprint = Some(task_fingerprint.into());
        self
    }

    /// Replaces the execution settings.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the per-stage deadline.
    #[must_use]
    pub fn with_stage_timeout(mut self, limit: Duration) -> Self {
        self.config = self.config.with_stage_timeout(limit);
        self
    }

    /// Registers a callback invoked exactly once when the pipeline finishes,
    /// fails, is served from the cache, or is dropped unfinished.
    #[must_use]
    pub fn on_done<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(PipelineOutcome) + Send + 'static,
    {
        self.done = Some(Arc::new(CompletionLatch::new(callback)));
        self
    }

    /// Returns the stages.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Returns the file this pipeline derives from, if tagged.
    #[must_use]
    pub fn input_file(&self) -> Option<&Path> {
        self.input_file.as_deref()
    }

    /// Returns the task fingerprint, if tagged.
    #[must_use]
    pub fn task_fingerprint(&self) -> Option<&str> {
        self.task_fingerprint.as_deref()
    }

    /// Returns true when both the input file and the task fingerprint are set.
    #[must_use]
    pub fn is_tagged(&self) -> bool {
        self.input_file.is_some() && self.task_fingerprint.is_some()
    }

    /// Returns true when an output has been configured.
    #[must_use]
    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    pub(crate) fn take_output(&mut self) -> Option<Output> {
        self.output.take()
    }

    pub(crate) fn set_output(&mut self, output: Output) {
        self.output = Some(output);
    }

    /// Completes the pipeline without running it, reporting the cached file
    /// that stands in for its result.
    pub(crate) fn release_cached(mut self, path: &Path) {
        debug!(path = %path.display(), "Pipeline served from cache");
        if let Some(latch) = self.done.take() {
            latch.fire(PipelineOutcome::Cached(path.to_path_buf()));
        }
    }

    /// Runs every stage in order and delivers the result to the output.
    ///
    /// Fails with a configuration error when no input or output is set. The
    /// `on_done` callback fires before this returns, with the same outcome.
    pub async fn exec(mut self) -> Result<PipelineReport> {
        let latch = self
            .done
            .take()
            .unwrap_or_else(|| Arc::new(CompletionLatch::empty()));
        let guard = DoneGuard {
            latch: Arc::clone(&latch),
        };

        let stage_count = self.stages.len();
        let result = self.run().await;
        match &result {
            Ok(report) => {
                info!(
                    stages = stage_count,
                    bytes_out = report.bytes_out,
                    duration_ms = report.duration_ms,
                    "Pipeline completed"
                );
                latch.fire(PipelineOutcome::Completed(report.clone()));
            }
            Err(err) => {
                warn!(error = %err, "Pipeline failed");
                latch.fire(PipelineOutcome::Failed(err.to_string()));
            }
        }
        drop(guard);
        result
    }

    async fn run(self) -> Result<PipelineReport> {
        let input = self
            .input
            .ok_or_else(|| MinitaskError::config("pipeline has no input"))?;
        let output = self
            .output
            .ok_or_else(|| MinitaskError::config("pipeline has no output"))?;

        debug!(stages = self.stages.len(), ?input, ?output, "Executing pipeline");
        Engine::new(self.config.stage_timeout())
            .run(self.stages, input, output)
            .await
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("input_file", &self.input_file)
            .field("task_fingerprint", &self.task_fingerprint)
            .finish_non_exhaustive()
    }
}

/// Reports a failure if `exec` is abandoned before it finishes.
struct DoneGuard {
    latch: Arc<CompletionLatch<PipelineOutcome>>,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let err = MinitaskError::Cancelled("pipeline dropped before completion".to_string());
        self.latch.fire(PipelineOutcome::Failed(err.to_string()));
    }
}
