//! Streaming stages: a writable side, a readable side and the work between.

use futures::future::BoxFuture;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tracing::debug;

/// Readable side of a streaming stage.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable side of a streaming stage.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Work that must run while data flows through a stage, resolving when the
/// stage has finished (a child process exiting, a transform task flushing).
pub type StageWorker = BoxFuture<'static, anyhow::Result<()>>;

/// A stage that transforms bytes as they flow.
///
/// Data written into [`StreamStage::new`]'s writer comes out of its reader,
/// possibly transformed and interleaved with other data in flight. The
/// pipeline closes the writer when its input is exhausted and reads the
/// reader until end of stream.
pub struct StreamStage {
    label: String,
    writer: BoxWriter,
    reader: BoxReader,
    worker: Option<StageWorker>,
}

impl StreamStage {
    /// Creates a streaming stage from an arbitrary writer/reader pair.
    pub fn new<W, R>(label: impl Into<String>, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            label: label.into(),
            writer: Box::new(writer),
            reader: Box::new(reader),
            worker: None,
        }
    }

    /// Attaches work that must complete for the stage to count as finished.
    ///
    /// The worker is spawned when the pipeline wires the stage, not before.
    #[must_use]
    pub fn with_worker(mut self, worker: StageWorker) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Spawns `command` as a streaming stage.
    ///
    /// stdin and stdout are piped; stderr is inherited so failures are not
    /// hidden behind buffered stdout. The child is killed if the pipeline is
    /// dropped before it exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned.
    pub fn spawn(mut command: Command) -> io::Result<Self> {
        let std_command = command.as_std();
        let label = std::iter::once(std_command.get_program())
            .chain(std_command.get_args())
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout unavailable"))?;

        debug!(process = %label, pid = ?child.id(), "Spawned process stage");

        let worker_label = label.clone();
        let worker: StageWorker = Box::pin(async move {
            let status = child.wait().await?;
            debug!(process = %worker_label, %status, "Process stage exited");
            check_exit(status)
        });

        Ok(Self::new(label, stdin, stdout).with_worker(worker))
    }

    /// Returns the label of the stage.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Splits the stage into its writer, reader and optional worker.
    #[must_use]
    pub fn into_parts(self) -> (BoxWriter, BoxReader, Option<StageWorker>) {
        (self.writer, self.reader, self.worker)
    }
}

impl fmt::Debug for StreamStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamStage")
            .field("label", &self.label)
            .field("has_worker", &self.worker.is_some())
            .finish()
    }
}

/// Maps a child's exit status to a stage outcome.
///
/// A child killed by SIGPIPE stopped because its consumer went away, which
/// is not a failure of the child.
fn check_exit(status: ExitStatus) -> anyhow::Result<()> {
    if status.success() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        const SIGPIPE: i32 = 13;
        if status.signal() == Some(SIGPIPE) {
            return Ok(());
        }
    }

    Err(anyhow::anyhow!("process exited with {status}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_spawned_process_round_trip() {
        let stage = StreamStage::spawn(Command::new("cat")).unwrap();
        assert_eq!(stage.label(), "cat");

        let (mut writer, mut reader, worker) = stage.into_parts();
        writer.write_all(b"hello").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello".to_vec());
        worker.unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_process_reports_status() {
        let stage = StreamStage::spawn(Command::new("false")).unwrap();
        let (writer, mut reader, worker) = stage.into_parts();
        drop(writer);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        let err = worker.unwrap().await.unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let result = runtime.block_on(async {
            StreamStage::spawn(Command::new("definitely-not-a-real-program-xyz"))
        });
        assert!(result.is_err());
    }
}
