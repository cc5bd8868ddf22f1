//! In-process streaming transforms.

use super::{StageWorker, StreamStage};
use crate::errors::is_broken_pipe;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Capacity of the in-memory pipes on either side of a transform.
const PIPE_CAPACITY: usize = 64 * 1024;

/// A chunk-at-a-time transform, run as a streaming stage.
///
/// `transform` sees every chunk in order and returns the bytes to emit for
/// it; `flush` runs once at end of input (also for empty input) and returns
/// any trailing bytes.
pub trait ChunkTransform: Send + 'static {
    /// Transforms one chunk.
    fn transform(&mut self, chunk: &[u8]) -> Vec<u8>;

    /// Emits trailing output once the input is exhausted.
    fn flush(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

impl StreamStage {
    /// Runs `transform` between two in-memory pipes.
    ///
    /// The transform loop is the stage's worker, so it only starts once the
    /// pipeline wires the stage.
    pub fn transform<T>(label: impl Into<String>, mut transform: T) -> Self
    where
        T: ChunkTransform,
    {
        let (writer, mut upstream) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut downstream, reader) = tokio::io::duplex(PIPE_CAPACITY);

        let worker: StageWorker = Box::pin(async move {
            let mut buf = vec![0_u8; 8 * 1024];
            let written: std::io::Result<()> = async {
                loop {
                    let read = upstream.read(&mut buf).await?;
                    if read == 0 {
                        break;
                    }
                    let out = transform.transform(&buf[..read]);
                    if !out.is_empty() {
                        downstream.write_all(&out).await?;
                    }
                }
                let tail = transform.flush();
                if !tail.is_empty() {
                    downstream.write_all(&tail).await?;
                }
                downstream.shutdown().await
            }
            .await;

            match written {
                Err(err) if is_broken_pipe(&err) => Ok(()),
                other => other.map_err(Into::into),
            }
        });

        Self::new(label, writer, reader).with_worker(worker)
    }
}
