//! Bounded-concurrency execution of many pipelines.
//!
//! This module provides:
//! - [`Scheduler`]: runs work items with at most `concurrency_limit`
//!   pipelines in flight, consulting the cache for tagged pipelines
//! - [`WorkItem`] / [`OutputHook`]: pipelines and ordering hooks
//! - [`RunOptions`]: serde-loadable run configuration
//!
//! Every executed pipeline writes into a file first. Once all items are
//! resolved, results are replayed in the original item order, so the final
//! output never depends on completion order. Cache work (fingerprinting,
//! index writes, deletions) runs on the blocking pool.

mod options;
mod work;

#[cfg(test)]
mod integration_tests;

pub use options::RunOptions;
pub use work::{CacheLookup, FnHook, OutputHook, TextHook, WorkItem};

use crate::cache::{CacheRecord, CacheRegistry, CacheStore};
use crate::errors::{MinitaskError, Result};
use crate::pipeline::{with_deadline, CompletionLatch, Output, Pipeline, PipelineReport};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempPath;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Summary of one scheduler run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Number of work items, hooks included.
    pub items: usize,
    /// Tagged pipelines served from the cache, or from an identical item
    /// earlier in the same run.
    pub hits: usize,
    /// Tagged pipelines that had to execute.
    pub misses: usize,
    /// Pipelines executed, tagged or not.
    pub executed: usize,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
}

/// Where a pipeline's result bytes live until assembly.
enum ResultFile {
    /// An existing cache entry.
    Cached(PathBuf),
    /// A new cache entry, recorded once the pipeline succeeds.
    Recorded(PathBuf),
    /// Scratch space removed after replay.
    Scratch(TempPath),
}

impl ResultFile {
    fn path(&self) -> &Path {
        match self {
            Self::Cached(path) | Self::Recorded(path) => path,
            Self::Scratch(path) => &**path,
        }
    }
}

/// An item awaiting assembly.
enum Slot {
    Hook(Box<dyn OutputHook>),
    Result {
        file: ResultFile,
        destination: Option<Output>,
    },
}

/// How the cache resolved one work item.
enum Resolution {
    /// Not eligible for caching in this run.
    Uncached,
    /// Served from an existing entry.
    Hit(PathBuf),
    /// Served by the result of an identical earlier item.
    Shared(PathBuf),
    /// Must execute; `result` is recorded under `task` once it succeeds.
    Miss {
        record: CacheRecord,
        task: String,
        result: PathBuf,
    },
}

/// A queued pipeline and the cache entry it fills on success.
struct Job {
    index: usize,
    pipeline: Pipeline,
    recording: Option<(CacheRecord, String, PathBuf)>,
}

type Running = FuturesUnordered<JoinHandle<(usize, Result<PipelineReport>)>>;

type CompleteFn = Arc<dyn Fn(RunReport) + Send + Sync>;

/// Input file and task fingerprint of a tagged pipeline.
type Tag = (PathBuf, String);

/// Runs work items under a concurrency limit with cache-aware skipping.
pub struct Scheduler {
    options: RunOptions,
    registry: Arc<CacheRegistry>,
    on_complete: Option<CompleteFn>,
}

impl Scheduler {
    /// Creates a scheduler with its own cache registry.
    #[must_use]
    pub fn new(options: RunOptions) -> Self {
        Self {
            options,
            registry: Arc::new(CacheRegistry::new()),
            on_complete: None,
        }
    }

    /// Shares a cache registry with other schedulers.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<CacheRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Registers a callback fired exactly once per successful run, after the
    /// final output has been written and flushed.
    #[must_use]
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(RunReport) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    /// The run configuration.
    #[must_use]
    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Executes `items` and writes their results to `output` in item order.
    ///
    /// Fails before running anything if a tagged pipeline is present but no
    /// cache directory or fingerprint method is configured. The first failing
    /// pipeline aborts those still running and fails the run; nothing is
    /// recorded for it.
    pub async fn run<W>(&self, items: Vec<WorkItem>, output: &mut W) -> Result<RunReport>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let start = Instant::now();
        let total = items.len();
        let done = match &self.on_complete {
            Some(callback) => {
                let callback = Arc::clone(callback);
                CompletionLatch::new(move |report: RunReport| callback(report))
            }
            None => CompletionLatch::empty(),
        };
        let tags = cache_tags(&items);
        let store = self.open_store(&tags).await?;
        let resolutions = self.resolve(store.as_ref(), tags).await?;

        info!(
            items = total,
            limit = self.options.limit(),
            cache_enabled = self.options.cache_enabled,
            "Starting run"
        );

        let mut slots = Vec::with_capacity(total);
        let mut jobs = Vec::new();
        let (mut hits, mut misses) = (0, 0);
        for (index, (item, resolution)) in items.into_iter().zip(resolutions).enumerate() {
            let mut pipeline = match item {
                WorkItem::Hook(hook) => {
                    slots.push(Slot::Hook(hook));
                    continue;
                }
                WorkItem::Pipeline(pipeline) => pipeline,
            };
            let destination = pipeline.take_output();

            let (file, recording) = match resolution {
                Resolution::Hit(path) | Resolution::Shared(path) => {
                    hits += 1;
                    debug!(index, path = %path.display(), "Cache hit");
                    pipeline.release_cached(&path);
                    slots.push(Slot::Result {
                        file: ResultFile::Cached(path),
                        destination,
                    });
                    continue;
                }
                Resolution::Miss {
                    record,
                    task,
                    result,
                } => {
                    misses += 1;
                    debug!(index, file = %record.file().display(), task = %task, "Cache miss");
                    (
                        ResultFile::Recorded(result.clone()),
                        Some((record, task, result)),
                    )
                }
                Resolution::Uncached => (ResultFile::Scratch(scratch_path(store.as_deref())?), None),
            };
            pipeline.set_output(Output::file(file.path()));
            jobs.push(Job {
                index,
                pipeline,
                recording,
            });
            slots.push(Slot::Result { file, destination });
        }

        let executed = jobs.len();
        self.execute(jobs).await?;

        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Slot::Hook(hook) => hook.write(&mut *output).await?,
                Slot::Result { file, destination } => {
                    replay(file.path(), destination, output).await?;
                    debug!(index, "Replayed result");
                }
            }
        }

        output.flush().await?;
        if self.options.close_output_on_completion {
            output.shutdown().await?;
        }

        let report = RunReport {
            items: total,
            hits,
            misses,
            executed,
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        };
        info!(
            items = report.items,
            hits = report.hits,
            misses = report.misses,
            executed = report.executed,
            duration_ms = report.duration_ms,
            "Run completed"
        );
        done.fire(report.clone());
        Ok(report)
    }

    async fn open_store(&self, tags: &[Option<Tag>]) -> Result<Option<Arc<CacheStore>>> {
        let tagged = tags.iter().flatten().count();

        match (&self.options.cache_dir, self.options.fingerprint_method) {
            (Some(dir), Some(method)) => {
                let registry = Arc::clone(&self.registry);
                let dir = dir.clone();
                blocking(move || registry.store(dir, method)).await.map(Some)
            }
            _ if tagged > 0 => Err(MinitaskError::config(format!(
                "{tagged} tagged pipeline(s) need both cache_dir and fingerprint_method to be set"
            ))),
            _ => Ok(None),
        }
    }

    /// Consults the cache for every item in one batch, off the async workers.
    async fn resolve(
        &self,
        store: Option<&Arc<CacheStore>>,
        tags: Vec<Option<Tag>>,
    ) -> Result<Vec<Resolution>> {
        match store {
            Some(store) if self.options.cache_enabled => {
                let store = Arc::clone(store);
                blocking(move || resolve_batch(&store, tags)).await
            }
            _ => Ok(tags.iter().map(|_| Resolution::Uncached).collect()),
        }
    }

    async fn execute(&self, jobs: Vec<Job>) -> Result<()> {
        let mut queue = jobs.into_iter();
        let mut recordings = HashMap::new();
        let mut running = Running::new();

        for job in queue.by_ref().take(self.options.limit()) {
            running.push(self.launch(job, &mut recordings));
        }

        let result = self.drain(&mut running, &mut queue, &mut recordings).await;
        if result.is_err() {
            for handle in running.iter() {
                handle.abort();
            }
            for (record, _, path) in recordings.values() {
                record.store().discard_result(path);
            }
            warn!(aborted = running.len(), "Run failed; aborted running pipelines");
        }
        result
    }

    async fn drain(
        &self,
        running: &mut Running,
        queue: &mut std::vec::IntoIter<Job>,
        recordings: &mut HashMap<usize, (CacheRecord, String, PathBuf)>,
    ) -> Result<()> {
        while let Some(joined) = running.next().await {
            let (index, result) = joined.map_err(|err| MinitaskError::Join(err.to_string()))?;
            let report = match result {
                Ok(report) => report,
                Err(err) => {
                    if let Some((record, _, path)) = recordings.remove(&index) {
                        record.store().discard_result(&path);
                    }
                    return Err(err);
                }
            };
            debug!(index, duration_ms = report.duration_ms, "Pipeline finished");

            if let Some((record, task, path)) = recordings.remove(&index) {
                blocking(move || record.set_path(&[task.as_str()], &path)).await?;
            }

            if let Some(job) = queue.next() {
                tokio::task::yield_now().await;
                running.push(self.launch(job, recordings));
            }
        }
        Ok(())
    }

    fn launch(
        &self,
        job: Job,
        recordings: &mut HashMap<usize, (CacheRecord, String, PathBuf)>,
    ) -> JoinHandle<(usize, Result<PipelineReport>)> {
        let Job {
            index,
            pipeline,
            recording,
        } = job;
        if let Some(recording) = recording {
            recordings.insert(index, recording);
        }

        let limit = self.options.pipeline_timeout();
        tokio::spawn(async move {
            let what = format!("pipeline {index}");
            let result = with_deadline(limit, &what, pipeline.exec())
                .await
                .and_then(|inner| inner);
            (index, result)
        })
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("options", &self.options)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Runs synchronous cache work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| MinitaskError::Join(err.to_string()))?
}

/// The input file and task fingerprint of each tagged pipeline.
fn cache_tags(items: &[WorkItem]) -> Vec<Option<Tag>> {
    items
        .iter()
        .map(|item| match item {
            WorkItem::Pipeline(pipeline) => pipeline
                .input_file()
                .zip(pipeline.task_fingerprint())
                .map(|(file, task)| (file.to_path_buf(), task.to_string())),
            WorkItem::Hook(_) => None,
        })
        .collect()
}

/// Looks up every tagged item under one store batch.
///
/// A (file, task) pair seen as a miss earlier in the batch is served by that
/// earlier item's result instead of executing again.
fn resolve_batch(store: &Arc<CacheStore>, tags: Vec<Option<Tag>>) -> Result<Vec<Resolution>> {
    let _batch = store.batch();
    let mut pending: HashMap<Tag, PathBuf> = HashMap::new();

    tags.into_iter()
        .map(|tag| {
            let Some((file, task)) = tag else {
                return Ok(Resolution::Uncached);
            };
            let record = store.record(&file)?;
            let key = (record.file().to_path_buf(), task);
            if let Some(result) = pending.get(&key) {
                return Ok(Resolution::Shared(result.clone()));
            }

            match lookup(&record, &key.1)? {
                CacheLookup::Hit(path) => Ok(Resolution::Hit(path)),
                CacheLookup::Miss => {
                    let result = store.new_result_path();
                    pending.insert(key.clone(), result.clone());
                    Ok(Resolution::Miss {
                        record,
                        task: key.1,
                        result,
                    })
                }
            }
        })
        .collect()
}

/// Consults the cache for one tracked file and task.
fn lookup(record: &CacheRecord, task: &str) -> Result<CacheLookup> {
    match record.path(&[task])? {
        Some(path) if path.is_file() => Ok(CacheLookup::Hit(path)),
        _ => Ok(CacheLookup::Miss),
    }
}

/// A scratch file next to the cache, or in the system temp dir without one.
fn scratch_path(store: Option<&CacheStore>) -> Result<TempPath> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(".minitask-");
    let file = match store {
        Some(store) => builder.tempfile_in(store.dir())?,
        None => builder.tempfile()?,
    };
    Ok(file.into_temp_path())
}

/// Streams one result file to the item's destination, or to `output`.
async fn replay<W>(source: &Path, destination: Option<Output>, output: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    match destination {
        None => {
            let mut file = tokio::fs::File::open(source).await?;
            tokio::io::copy(&mut file, output).await?;
        }
        Some(Output::Writer { mut sink, close }) => {
            let mut file = tokio::fs::File::open(source).await?;
            tokio::io::copy(&mut file, &mut sink).await?;
            sink.flush().await?;
            if close {
                sink.shutdown().await?;
            }
        }
        Some(Output::File(path)) => {
            tokio::fs::copy(source, &path).await?;
        }
        Some(Output::Callback(callback)) => {
            callback(tokio::fs::read(source).await?);
        }
    }
    Ok(())
}
