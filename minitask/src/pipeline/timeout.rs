//! Deadlines for pipeline waits.

use crate::errors::{MinitaskError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Per-pipeline execution settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Deadline for each async stage and for each wait on a stream to finish.
    /// `None` waits forever.
    #[serde(default)]
    pub stage_timeout_ms: Option<u64>,
}

impl PipelineConfig {
    /// Creates a configuration with no deadlines.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-stage deadline.
    #[must_use]
    pub fn with_stage_timeout(mut self, limit: Duration) -> Self {
        self.stage_timeout_ms = Some(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Returns the per-stage deadline.
    #[must_use]
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_ms.map(Duration::from_millis)
    }
}

/// Runs `future`, failing with [`MinitaskError::Timeout`] once `limit` passes.
///
/// With no limit the future is simply awaited.
pub async fn with_deadline<T, F>(limit: Option<Duration>, what: &str, future: F) -> Result<T>
where
    F: Future<Output = T>,
{
    match limit {
        None => Ok(future.await),
        Some(limit) => timeout(limit, future)
            .await
            .map_err(|_| MinitaskError::Timeout {
                what: what.to_string(),
                after_ms: limit.as_millis(),
            }),
    }
}
