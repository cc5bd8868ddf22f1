//! Configuration for scheduler runs.

use crate::cache::FingerprintMethod;
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for one [`Scheduler`](super::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Maximum number of pipelines executing at once.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Directory holding the cache index and result files.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// How tracked input files are fingerprinted.
    #[serde(default)]
    pub fingerprint_method: Option<FingerprintMethod>,
    /// Whether tagged pipelines are looked up in and recorded to the cache.
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    /// Whether the final output is shut down once every item is written.
    #[serde(default)]
    pub close_output_on_completion: bool,
    /// Deadline for each pipeline, in milliseconds.
    #[serde(default)]
    pub pipeline_timeout_ms: Option<u64>,
}

fn default_concurrency_limit() -> usize {
    16
}

fn default_cache_enabled() -> bool {
    true
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            cache_dir: None,
            fingerprint_method: None,
            cache_enabled: default_cache_enabled(),
            close_output_on_completion: false,
            pipeline_timeout_ms: None,
        }
    }
}

impl RunOptions {
    /// Creates options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from JSON; absent fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Sets the concurrency limit. Zero is treated as one.
    #[must_use]
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Sets the cache directory and fingerprint method.
    #[must_use]
    pub fn with_cache(mut self, dir: impl Into<PathBuf>, method: FingerprintMethod) -> Self {
        self.cache_dir = Some(dir.into());
        self.fingerprint_method = Some(method);
        self
    }

    /// Enables or disables cache lookups and recording.
    #[must_use]
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Sets whether the final output is shut down at the end of the run.
    #[must_use]
    pub fn with_close_output(mut self, close: bool) -> Self {
        self.close_output_on_completion = close;
        self
    }

    /// Sets a deadline for each pipeline.
    #[must_use]
    pub fn with_pipeline_timeout(mut self, limit: Duration) -> Self {
        self.pipeline_timeout_ms = Some(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// The effective concurrency limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.concurrency_limit.max(1)
    }

    /// The per-pipeline deadline.
    #[must_use]
    pub fn pipeline_timeout(&self) -> Option<Duration> {
        self.pipeline_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = RunOptions::default();
        assert_eq!(opts.concurrency_limit, 16);
        assert!(opts.cache_enabled);
        assert!(!opts.close_output_on_completion);
        assert!(opts.cache_dir.is_none());
        assert!(opts.pipeline_timeout().is_none());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let opts = RunOptions::from_json_str(
            r#"{"cache_dir": "/tmp/c", "fingerprint_method": "stat", "concurrency_limit": 2}"#,
        )
        .unwrap();

        assert_eq!(opts.concurrency_limit, 2);
        assert_eq!(opts.cache_dir, Some(PathBuf::from("/tmp/c")));
        assert_eq!(opts.fingerprint_method, Some(FingerprintMethod::Stat));
        assert!(opts.cache_enabled);
    }

    #[test]
    fn test_from_json_rejects_unknown_method() {
        assert!(RunOptions::from_json_str(r#"{"fingerprint_method": "crc"}"#).is_err());
    }

    #[test]
    fn test_builders() {
        let opts = RunOptions::new()
            .with_concurrency_limit(0)
            .with_cache("/tmp/c", FingerprintMethod::Md5)
            .with_cache_enabled(false)
            .with_close_output(true)
            .with_pipeline_timeout(Duration::from_millis(1500));

        assert_eq!(opts.limit(), 1);
        assert!(!opts.cache_enabled);
        assert!(opts.close_output_on_completion);
        assert_eq!(opts.pipeline_timeout(), Some(Duration::from_millis(1500)));
    }
}
