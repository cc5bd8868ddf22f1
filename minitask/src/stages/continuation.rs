//! Completion handle for continuation-style stages.

use tokio::sync::oneshot;

/// Receives the outcome of a continuation-style stage.
pub(crate) type ContinuationReceiver = oneshot::Receiver<anyhow::Result<Vec<u8>>>;

/// The "done" handle passed to a [`Stage::with_continuation`] function.
///
/// Completing consumes the handle, so a stage can report its outcome at most
/// once. Dropping it without completing fails the stage.
///
/// [`Stage::with_continuation`]: super::Stage::with_continuation
#[derive(Debug)]
pub struct Continuation {
    sender: oneshot::Sender<anyhow::Result<Vec<u8>>>,
}

impl Continuation {
    pub(crate) fn channel() -> (Self, ContinuationReceiver) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, receiver)
    }

    /// Completes the stage with an error or a value.
    pub fn complete(self, result: anyhow::Result<Vec<u8>>) {
        // The pipeline may already have given up (e.g. timed out).
        let _ = self.sender.send(result);
    }

    /// Completes the stage successfully.
    pub fn ok(self, value: impl Into<Vec<u8>>) {
        self.complete(Ok(value.into()));
    }

    /// Fails the stage.
    pub fn fail(self, error: impl Into<anyhow::Error>) {
        self.complete(Err(error.into()));
    }
}
