//! One-shot completion signalling.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

type Callback<T> = Box<dyn FnOnce(T) + Send>;

/// Invokes a callback at most once, no matter how many completion paths race.
///
/// Only the first call to [`fire`](Self::fire) reaches the callback; later
/// calls are ignored and return `false`.
pub struct CompletionLatch<T> {
    fired: AtomicBool,
    callback: Mutex<Option<Callback<T>>>,
}

impl<T> CompletionLatch<T> {
    /// Creates a latch around `callback`.
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        Self {
            fired: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    /// Creates a latch with no callback; it still records whether it fired.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            fired: AtomicBool::new(false),
            callback: Mutex::new(None),
        }
    }

    /// Signals completion. Returns true if this call was the first.
    pub fn fire(&self, value: T) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(value);
        }
        true
    }

    /// Returns whether the latch has fired.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl<T> fmt::Debug for CompletionLatch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionLatch")
            .field("fired", &self.has_fired())
            .finish()
    }
}
