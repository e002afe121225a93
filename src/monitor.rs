//! Periodic maintenance tasks.
//!
//! Each monitor is a loop that sleeps for its interval, runs one scan and logs
//! what it did. A failing scan backs off along the fatal exception delay table,
//! which resets after the next successful scan. A queue whose tables do not exist
//! yet counts as empty.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{delay::DelayPolicy, error::Error, store::MessageStore, store::QueueStatus};

/// Sleeps for `duration` unless `token` fires first. Returns false when cancelled.
pub(crate) async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Runs `tick` every `interval` until `stop` fires. `tick` receives `stop` so
/// long scans can bail out between items.
pub(crate) fn spawn<F, Fut>(
    name: &'static str,
    interval: Duration,
    fatal_delay: DelayPolicy,
    stop: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<u64, Error>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut failures = 0;

        tracing::debug!(monitor = name, ?interval, "monitor started");

        while sleep_or_cancel(interval, &stop).await {
            match tick(stop.clone()).await {
                Ok(count) => {
                    failures = 0;
                    if count > 0 {
                        tracing::info!(monitor = name, count, "monitor processed messages");
                    }
                }
                Err(e) if e.is_missing_table() => {
                    failures = 0;
                    tracing::debug!(monitor = name, "queue not provisioned yet");
                }
                Err(e) => {
                    tracing::error!(monitor = name, error = %e, "monitor scan failed");
                    let delay = fatal_delay.get(failures);
                    failures += 1;
                    if !sleep_or_cancel(delay, &stop).await {
                        break;
                    }
                }
            }
        }

        tracing::debug!(monitor = name, "monitor stopped");
    })
}

/// Deletes `Waiting` messages whose expiration time has passed. Stops between
/// messages when `cancel` fires and returns the count deleted so far.
pub async fn clear_expired_messages<S: MessageStore>(
    store: &S,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<u64, Error> {
    let expired = match store.find_expired_messages(now).await {
        Err(e) if e.is_missing_table() => return Ok(0),
        result => result?,
    };

    let mut cleared = 0;
    for queue_id in expired {
        if cancel.is_cancelled() {
            break;
        }
        if store.delete_waiting_message(queue_id).await? {
            tracing::debug!(%queue_id, "deleted expired message");
            cleared += 1;
        }
    }
    Ok(cleared)
}

/// Deletes error-table messages that failed before `older_than`.
pub async fn clear_error_messages<S: MessageStore>(
    store: &S,
    older_than: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<u64, Error> {
    let old = match store.find_old_errors(older_than).await {
        Err(e) if e.is_missing_table() => return Ok(0),
        result => result?,
    };

    let mut cleared = 0;
    for queue_id in old {
        if cancel.is_cancelled() {
            break;
        }
        if store.delete_error_message(queue_id).await? {
            tracing::debug!(%queue_id, "deleted old error message");
            cleared += 1;
        }
    }
    Ok(cleared)
}

pub(crate) fn spawn_expiration<S: MessageStore>(
    store: Arc<S>,
    interval: Duration,
    fatal_delay: DelayPolicy,
    stop: CancellationToken,
) -> JoinHandle<()> {
    spawn("message expiration", interval, fatal_delay, stop, move |cancel| {
        let store = store.clone();
        async move { clear_expired_messages(&*store, Utc::now(), &cancel).await }
    })
}

pub(crate) fn spawn_error_cleanup<S: MessageStore>(
    store: Arc<S>,
    interval: Duration,
    message_age: Duration,
    fatal_delay: DelayPolicy,
    stop: CancellationToken,
) -> JoinHandle<()> {
    spawn("message error", interval, fatal_delay, stop, move |cancel| {
        let store = store.clone();
        async move { clear_error_messages(&*store, Utc::now() - message_age, &cancel).await }
    })
}

/// Latest counts read by the status monitor.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    inner: Arc<Mutex<Option<(DateTime<Utc>, QueueStatus)>>>,
}

impl StatusSnapshot {
    /// The last counts and when they were read; `None` before the first scan.
    pub fn get(&self) -> Option<(DateTime<Utc>, QueueStatus)> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, status: QueueStatus) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some((Utc::now(), status));
    }
}

pub(crate) fn spawn_status<S: MessageStore>(
    store: Arc<S>,
    interval: Duration,
    fatal_delay: DelayPolicy,
    snapshot: StatusSnapshot,
    stop: CancellationToken,
) -> JoinHandle<()> {
    spawn("queue status", interval, fatal_delay, stop, move |_| {
        let store = store.clone();
        let snapshot = snapshot.clone();
        async move {
            let status = store.queue_status().await?;
            tracing::info!(
                waiting = status.waiting,
                processing = status.processing,
                error = status.error,
                "queue status"
            );
            snapshot.set(status);
            Ok(0)
        }
    })
}
