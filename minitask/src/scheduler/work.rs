//! Work items accepted by the scheduler.

use crate::pipeline::Pipeline;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Writes directly into the final output during assembly.
///
/// Hooks run in their position in the item list, after every earlier item has
/// been written. Typical uses are headers, separators and footers.
#[async_trait]
pub trait OutputHook: Send {
    /// Writes this hook's bytes to `out`.
    async fn write(self: Box<Self>, out: &mut (dyn AsyncWrite + Send + Unpin)) -> io::Result<()>;
}

/// A hook that writes a fixed byte string.
#[derive(Debug, Clone)]
pub struct TextHook(Vec<u8>);

#[async_trait]
impl OutputHook for TextHook {
    async fn write(self: Box<Self>, out: &mut (dyn AsyncWrite + Send + Unpin)) -> io::Result<()> {
        out.write_all(&self.0).await
    }
}

/// A hook that renders its bytes with a closure at assembly time.
pub struct FnHook<F>(F);

#[async_trait]
impl<F> OutputHook for FnHook<F>
where
    F: FnOnce(&mut Vec<u8>) + Send,
{
    async fn write(self: Box<Self>, out: &mut (dyn AsyncWrite + Send + Unpin)) -> io::Result<()> {
        let render = self.0;
        let mut buf = Vec::new();
        render(&mut buf);
        out.write_all(&buf).await
    }
}

/// One unit of scheduled work.
pub enum WorkItem {
    /// A pipeline, possibly tagged for caching.
    Pipeline(Pipeline),
    /// An ordering function writing straight to the final output.
    Hook(Box<dyn OutputHook>),
}

impl WorkItem {
    /// A hook that writes `text` verbatim.
    pub fn text(text: impl Into<Vec<u8>>) -> Self {
        Self::Hook(Box::new(TextHook(text.into())))
    }

    /// A hook that renders into a buffer when its turn comes.
    pub fn write_with<F>(render: F) -> Self
    where
        F: FnOnce(&mut Vec<u8>) + Send + 'static,
    {
        Self::Hook(Box::new(FnHook(render)))
    }

    /// Wraps a custom hook.
    pub fn hook(hook: impl OutputHook + 'static) -> Self {
        Self::Hook(Box::new(hook))
    }
}

impl From<Pipeline> for WorkItem {
    fn from(pipeline: Pipeline) -> Self {
        Self::Pipeline(pipeline)
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline(pipeline) => f.debug_tuple("Pipeline").field(pipeline).finish(),
            Self::Hook(_) => f.write_str("Hook"),
        }
    }
}

/// Result of consulting the cache for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// A valid result file exists.
    Hit(PathBuf),
    /// The pipeline must execute.
    Miss,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn render(item: WorkItem) -> Vec<u8> {
        let WorkItem::Hook(hook) = item else {
            panic!("expected a hook");
        };
        let mut out: Vec<u8> = Vec::new();
        hook.write(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_text_hook() {
        assert_eq!(render(WorkItem::text("header\n")).await, b"header\n".to_vec());
    }

    #[tokio::test]
    async fn test_closure_hook() {
        let item = WorkItem::write_with(|buf| buf.extend_from_slice(b"footer"));
        assert_eq!(render(item).await, b"footer".to_vec());
    }

    #[test]
    fn test_pipeline_conversion() {
        let item = WorkItem::from(Pipeline::new(&[]));
        assert!(matches!(item, WorkItem::Pipeline(_)));
        assert_eq!(format!("{:?}", WorkItem::text("x")), "Hook");
    }
}
