//! The stage execution loop.
//!
//! Stages run strictly in declared order. The value travelling between them
//! is either a complete buffer or a live stream:
//!
//! - consecutive streaming stages are wired reader-to-writer by pump tasks,
//!   so nothing is buffered between them and external processes run
//!   concurrently;
//! - a sync or async stage after a stream waits until the stream has ended
//!   and every stage feeding it has finished, then receives the whole value;
//! - a buffered value entering a streaming stage is written into it and the
//!   stage's input is closed.

use super::io::{Input, Output};
use super::timeout::with_deadline;
use crate::errors::{is_broken_pipe, MinitaskError, Result};
use crate::stages::{BoxReader, BoxWriter, Resolved, Stage};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, trace};

/// Where a pipeline is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Constructed, not started.
    Idle,
    /// Resolving inputs and stages.
    Wiring,
    /// The current value is a live stream.
    Streaming,
    /// The current value is a complete buffer.
    Buffering,
    /// Every stage ran and the output was delivered.
    Completed,
    /// A stage failed; no further stages ran.
    Failed,
}

/// Summary of a finished pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Final state.
    pub state: PipelineState,
    /// Number of stages executed.
    pub stages: usize,
    /// How many of them ran as streams.
    pub streamed_stages: usize,
    /// Bytes delivered to the output.
    pub bytes_out: u64,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
}

/// The value travelling between stages.
enum Carrier {
    Buffered(Vec<u8>),
    Stream(BoxReader),
}

/// Outcome of a background task: stage index, label, result.
type Finished = (usize, String, anyhow::Result<()>);

/// Executes one stage list against one input.
///
/// Background work (pumps between streams, process waits, transform loops)
/// lives in a `JoinSet`, so dropping the engine aborts all of it.
pub(crate) struct Engine {
    background: JoinSet<Finished>,
    stage_timeout: Option<Duration>,
    state: PipelineState,
}

impl Engine {
    pub(crate) fn new(stage_timeout: Option<Duration>) -> Self {
        Self {
            background: JoinSet::new(),
            stage_timeout,
            state: PipelineState::Idle,
        }
    }

    pub(crate) async fn run(
        mut self,
        stages: Vec<Stage>,
        input: Input,
        output: Output,
    ) -> Result<PipelineReport> {
        let start = Instant::now();
        let total = stages.len();
        let mut streamed_stages = 0;

        self.transition(PipelineState::Wiring);
        let mut carrier = match input {
            Input::Value(value) => Carrier::Buffered(value),
            Input::Reader(reader) => Carrier::Stream(reader),
            Input::File(path) => {
                let file = tokio::fs::File::open(&path).await.map_err(|err| {
                    io::Error::new(err.kind(), format!("{}: {err}", path.display()))
                })?;
                Carrier::Stream(Box::new(file))
            }
        };

        for (index, stage) in stages.into_iter().enumerate() {
            let label = stage.label().to_string();
            trace!(index, stage = %label, kind = %stage.kind(), "Wiring stage");

            carrier = match stage.resolve(index)? {
                Resolved::Sync(func) => {
                    let value = self.settle(carrier).await?;
                    self.transition(PipelineState::Buffering);
                    let next = func(value).map_err(|err| MinitaskError::stage(index, &label, err))?;
                    Carrier::Buffered(next)
                }
                Resolved::Async(func) => {
                    let value = self.settle(carrier).await?;
                    self.transition(PipelineState::Buffering);
                    let next = with_deadline(self.stage_timeout, &label, func(value))
                        .await?
                        .map_err(|err| MinitaskError::stage(index, &label, err))?;
                    Carrier::Buffered(next)
                }
                Resolved::Stream(stream) => {
                    self.transition(PipelineState::Streaming);
                    streamed_stages += 1;
                    let (writer, reader, worker) = stream.into_parts();
                    if let Some(worker) = worker {
                        let worker_label = label.clone();
                        self.background
                            .spawn(async move { (index, worker_label, worker.await) });
                    }
                    self.feed(index, &label, carrier, writer);
                    Carrier::Stream(reader)
                }
            };
        }

        let bytes_out = self.deliver(carrier, output).await?;
        self.transition(PipelineState::Completed);

        Ok(PipelineReport {
            state: self.state,
            stages: total,
            streamed_stages,
            bytes_out,
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }

    fn transition(&mut self, next: PipelineState) {
        if self.state != next {
            trace!(from = ?self.state, to = ?next, "Pipeline state change");
            self.state = next;
        }
    }

    /// Moves the current value into a streaming stage's writer.
    ///
    /// A stream is copied chunk by chunk; a buffer is written whole. Either
    /// way the writer is closed afterwards so the stage sees end of input.
    fn feed(&mut self, index: usize, label: &str, carrier: Carrier, mut writer: BoxWriter) {
        let pump_label = format!("{label} (input)");
        self.background.spawn(async move {
            let copied = match carrier {
                Carrier::Buffered(value) => writer.write_all(&value).await,
                Carrier::Stream(mut reader) => {
                    tokio::io::copy(&mut reader, &mut writer).await.map(|_| ())
                }
            };
            let closed = match copied {
                Ok(()) => writer.shutdown().await,
                Err(err) => Err(err),
            };
            let result = tolerate_broken_pipe(closed).map_err(anyhow::Error::from);
            (index, pump_label, result)
        });
    }

    /// Turns the current value into a complete buffer.
    async fn settle(&mut self, carrier: Carrier) -> Result<Vec<u8>> {
        match carrier {
            Carrier::Buffered(value) => Ok(value),
            Carrier::Stream(mut reader) => {
                let mut value = Vec::new();
                with_deadline(
                    self.stage_timeout,
                    "reading stream output",
                    reader.read_to_end(&mut value),
                )
                .await??;
                self.join_background().await?;
                debug!(bytes = value.len(), "Buffered stream output");
                Ok(value)
            }
        }
    }

    /// Writes the final value into the configured output.
    async fn deliver(&mut self, carrier: Carrier, output: Output) -> Result<u64> {
        match output {
            Output::Callback(callback) => {
                let value = self.settle(carrier).await?;
                let len = value.len() as u64;
                callback(value);
                Ok(len)
            }
            Output::Writer { mut sink, close } => {
                let written = self.drain_into(carrier, &mut sink).await?;
                if close {
                    tolerate_broken_pipe(sink.shutdown().await)?;
                }
                Ok(written)
            }
            Output::File(path) => {
                let mut file = tokio::fs::File::create(&path).await.map_err(|err| {
                    io::Error::new(err.kind(), format!("{}: {err}", path.display()))
                })?;
                let written = self.drain_into(carrier, &mut file).await?;
                file.shutdown().await?;
                Ok(written)
            }
        }
    }

    async fn drain_into<W>(&mut self, carrier: Carrier, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let written = match carrier {
            Carrier::Buffered(value) => {
                tolerate_broken_pipe(sink.write_all(&value).await)?;
                value.len() as u64
            }
            Carrier::Stream(mut reader) => {
                let copied = with_deadline(
                    self.stage_timeout,
                    "streaming output",
                    tokio::io::copy(&mut reader, sink),
                )
                .await?;
                tolerate_broken_pipe(copied)?
            }
        };
        tolerate_broken_pipe(sink.flush().await)?;
        self.join_background().await?;
        Ok(written)
    }

    /// Waits for every pump and worker spawned so far, surfacing the first
    /// real failure.
    async fn join_background(&mut self) -> Result<()> {
        let limit = self.stage_timeout;
        while let Some(joined) = with_deadline(
            limit,
            "waiting for streaming stages",
            self.background.join_next(),
        )
        .await?
        {
            match joined {
                Ok((_, _, Ok(()))) => {}
                Ok((index, label, Err(err))) => {
                    return Err(MinitaskError::stage(index, label, err));
                }
                Err(err) => return Err(MinitaskError::Join(err.to_string())),
            }
        }
        Ok(())
    }
}

/// Treats a consumer that stopped reading as a clean finish.
fn tolerate_broken_pipe<T: Default>(result: io::Result<T>) -> io::Result<T> {
    match result {
        Err(err) if is_broken_pipe(&err) => {
            debug!(error = %err, "Downstream closed early");
            Ok(T::default())
        }
        other => other,
    }
}
