//! Transforms and stages for test pipelines.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::stages::{ChunkTransform, Stage};

/// Emits its input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl ChunkTransform for Passthrough {
    fn transform(&mut self, chunk: &[u8]) -> Vec<u8> {
        chunk.to_vec()
    }
}

/// Counts input bytes and emits the count followed by a newline, like `wc -c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteCount {
    seen: usize,
}

impl ChunkTransform for ByteCount {
    fn transform(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.seen += chunk.len();
        Vec::new()
    }

    fn flush(&mut self) -> Vec<u8> {
        format!("{}\n", self.seen).into_bytes()
    }
}

/// Upper-cases ASCII as it streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uppercase;

impl ChunkTransform for Uppercase {
    fn transform(&mut self, chunk: &[u8]) -> Vec<u8> {
        chunk.to_ascii_uppercase()
    }
}

/// Emits `prefix` before the first chunk and `suffix` at the end.
///
/// The prefix is emitted even for empty input.
#[derive(Debug, Clone)]
pub struct Wrap {
    prefix: Vec<u8>,
    suffix: Vec<u8>,
    started: bool,
}

impl Wrap {
    /// Creates a wrapping transform.
    #[must_use]
    pub fn new(prefix: impl Into<Vec<u8>>, suffix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
            started: false,
        }
    }
}

impl ChunkTransform for Wrap {
    fn transform(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len() + self.prefix.len());
        if !self.started {
            self.started = true;
            out.extend_from_slice(&self.prefix);
        }
        out.extend_from_slice(chunk);
        out
    }

    fn flush(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            out.extend_from_slice(&self.prefix);
        }
        out.extend_from_slice(&self.suffix);
        out
    }
}

/// A sync stage that passes its input through and counts invocations.
pub fn counting_stage(label: impl Into<String>, counter: Arc<AtomicUsize>) -> Stage {
    Stage::sync(label, move |input| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(input)
    })
}

/// A sync stage that fails whenever it is invoked.
///
/// Useful as a sentinel for asserting that cached work never executes.
pub fn failing_stage(label: impl Into<String>) -> Stage {
    let label = label.into();
    let message = format!("stage '{label}' must not run");
    Stage::sync(label, move |_input| Err(anyhow::anyhow!(message.clone())))
}

/// An async stage that waits for `delay`, then appends `text` to its input.
pub fn delayed_text_stage(label: impl Into<String>, delay: Duration, text: &str) -> Stage {
    let text = text.as_bytes().to_vec();
    Stage::async_fn(label, move |mut input| {
        let text = text.clone();
        async move {
            tokio::time::sleep(delay).await;
            input.extend_from_slice(&text);
            Ok(input)
        }
    })
}
