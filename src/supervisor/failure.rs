use anyhow::Error as AnyError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// The failure that brought a supervised job down.
#[derive(Clone)]
pub struct WorkerFailure {
    label: String,
    error: Arc<AnyError>,
}

impl WorkerFailure {
    pub fn new(label: impl Into<String>, error: AnyError) -> Self {
        Self {
            label: label.into(),
            error: Arc::new(error),
        }
    }

    /// Title of the worker that failed, `{group}/{index}`.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn error(&self) -> &AnyError {
        &self.error
    }
}

impl fmt::Debug for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerFailure")
            .field("label", &self.label)
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {} failed: {:#}", self.label, self.error)
    }
}

impl std::error::Error for WorkerFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref().as_ref())
    }
}

/// Remembers the first failure of a job and whether teardown has started.
///
/// Once stopping, later failures are dropped: they are usually the echo of
/// the teardown itself.
#[derive(Default)]
pub(crate) struct FailureLatch {
    stopping: AtomicBool,
    first: Mutex<Option<WorkerFailure>>,
}

impl FailureLatch {
    /// Records `failure` if it is the first one and teardown has not begun.
    /// Returns whether it was recorded.
    pub(crate) fn record(&self, failure: WorkerFailure) -> bool {
        if self.stopping.load(Ordering::SeqCst) {
            tracing::debug!(worker = failure.label(), error = %failure.error(), "ignoring failure during shutdown");
            return false;
        }

        let mut slot = self.first.lock().expect("failure latch mutex poisoned");
        if slot.is_some() {
            tracing::debug!(worker = failure.label(), error = %failure.error(), "ignoring failure after the first one");
            return false;
        }

        tracing::error!(worker = failure.label(), error = %failure.error(), "worker failed");
        *slot = Some(failure);
        true
    }

    /// Flips the latch into stopping. Returns `true` only for the caller that
    /// performed the transition.
    pub(crate) fn begin_stopping(&self) -> bool {
        !self.stopping.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn first(&self) -> Option<WorkerFailure> {
        self.first
            .lock()
            .expect("failure latch mutex poisoned")
            .clone()
    }
}
