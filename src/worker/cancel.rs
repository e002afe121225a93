//! The two tokens a consumer shuts down with.
//!
//! `stop` ends the claim loops: no new message is claimed once it fires. `cancel`
//! is handed to running handlers through their [`super::WorkerNotification`] so
//! they can abandon the current message.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct WorkerCancellation {
    stop: CancellationToken,
    cancel: CancellationToken,
}

impl WorkerCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Cancelling work implies stopping.
    pub fn cancel(&self) {
        self.stop.cancel();
        self.cancel.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// How each phase of a shutdown ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that exited after the stop signal alone.
    pub stopped: usize,
    /// Workers that exited only after their handlers were cancelled.
    pub cancelled: usize,
    /// Workers aborted after both waits ran out.
    pub aborted: usize,
    /// Workers still running when shutdown returned.
    pub abandoned: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.aborted == 0 && self.abandoned == 0
    }
}
