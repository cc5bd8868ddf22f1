//! Log output setup.
//!
//! The library only emits `tracing` events. Binaries and tests that want to
//! see them install a subscriber with [`init_tracing`].

use crate::errors::{MinitaskError, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracingConfig {
    /// `EnvFilter` directives, e.g. `minitask=debug`.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit one JSON object per event instead of human-readable lines.
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "minitask=info".to_string()
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

impl TracingConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filter directives.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Enables JSON output.
    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// The effective filter: the configured directives, extended by
    /// `RUST_LOG` when it is set.
    pub fn env_filter(&self) -> Result<EnvFilter> {
        let directives = match std::env::var("RUST_LOG") {
            Ok(env) if !env.trim().is_empty() => format!("{},{}", self.filter, env.trim()),
            _ => self.filter.clone(),
        };
        EnvFilter::try_new(&directives)
            .map_err(|err| MinitaskError::config(format!("invalid log filter '{directives}': {err}")))
    }
}

/// Installs a global `tracing` subscriber writing to stderr.
///
/// Fails if the filter does not parse or a global subscriber is already set.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let filter = config.env_filter()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| MinitaskError::config(format!("could not install subscriber: {err}")))
}
