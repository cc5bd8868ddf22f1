//! # Minitask
//!
//! An incremental task runner. Minitask composes processing stages into
//! linear pipelines, runs many pipelines under a concurrency limit, and
//! remembers each pipeline's result against a fingerprint of its input file
//! so unchanged work is skipped on the next run.
//!
//! - **Stages**: synchronous and asynchronous transforms, external processes
//!   and in-process streaming transforms, freely mixed
//! - **Cache**: a persistent per-directory index that invalidates itself when
//!   a tracked file changes
//! - **Scheduler**: bounded concurrency with results written in item order
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use minitask::prelude::*;
//!
//! let stages = vec![
//!     Stage::command("uglifyjs", ["-"]),
//!     Stage::map_text("wrap", |js| format!("(function(){{{js}}})();\n")),
//! ];
//!
//! let items = files
//!     .iter()
//!     .map(|file| Pipeline::from_file(file, &stages).with_task_fingerprint("minify-v1").into())
//!     .collect();
//!
//! let scheduler = Scheduler::new(RunOptions::new().with_cache(".cache", FingerprintMethod::Md5));
//! let report = scheduler.run(items, &mut tokio::io::stdout()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cache;
pub mod errors;
pub mod listing;
pub mod observability;
pub mod pipeline;
pub mod scheduler;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{
        CacheRecord, CacheRegistry, CacheStore, Fingerprint, FingerprintMethod,
    };
    pub use crate::errors::{MinitaskError, Result};
    pub use crate::listing::{FileList, ListedFile};
    pub use crate::observability::{init_tracing, TracingConfig};
    pub use crate::pipeline::{
        Input, Output, Pipeline, PipelineConfig, PipelineOutcome, PipelineReport, PipelineState,
    };
    pub use crate::scheduler::{OutputHook, RunOptions, RunReport, Scheduler, WorkItem};
    pub use crate::stages::{ChunkTransform, Continuation, Stage, StageKind, StreamStage};
}
