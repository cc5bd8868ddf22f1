//! Test fixtures for cache and scheduler tests.

use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::io::AsyncWrite;

/// A temporary workspace with an input directory and a cache directory.
#[derive(Debug)]
pub struct CacheFixture {
    root: TempDir,
}

impl CacheFixture {
    /// Creates a fresh fixture.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        Self { root }
    }

    /// Returns the fixture root.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Returns the cache directory (not created until a store opens it).
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.root.path().join("cache")
    }

    /// Writes an input file and returns its path.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn write_input(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.root.path().join("inputs").join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap_or_else(|err| panic!("mkdir: {err}"));
        }
        std::fs::write(&path, contents).unwrap_or_else(|err| panic!("write: {err}"));
        path
    }

    /// Rewrites a file and pushes its modification time forward, so both
    /// stat and content fingerprints observe the change.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn modify(&self, path: &Path, contents: &str) {
        std::fs::write(path, contents).unwrap_or_else(|err| panic!("write: {err}"));
        let later = SystemTime::now() + Duration::from_secs(10);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .unwrap_or_else(|err| panic!("open: {err}"));
        file.set_modified(later)
            .unwrap_or_else(|err| panic!("set_modified: {err}"));
    }

    /// Writes a file outside the cache directory and returns its path.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn write_external(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.root.path().join(name);
        std::fs::write(&path, contents).unwrap_or_else(|err| panic!("write: {err}"));
        path
    }
}

impl Default for CacheFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct BufferState {
    bytes: Vec<u8>,
    shutdowns: usize,
}

/// An in-memory sink that stays inspectable after being handed to a pipeline.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    state: Arc<Mutex<BufferState>>,
}

impl SharedBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything written so far.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }

    /// Returns the contents as lossy UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().bytes).into_owned()
    }

    /// Returns how many times the sink was shut down.
    #[must_use]
    pub fn shutdowns(&self) -> usize {
        self.state.lock().shutdowns
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.state.lock().bytes.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.state.lock().shutdowns += 1;
        Poll::Ready(Ok(()))
    }
}
