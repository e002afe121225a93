//! Workers: the claim, process and settle loop.
//!
//! A worker repeatedly claims one message, runs the handler on it and settles the
//! outcome: commit on success, rollback with a delay while the error's retry
//! schedule has entries left, otherwise move to the error table. Between empty
//! claims it waits along the queue delay table; after a failure of the loop
//! itself it waits along the fatal exception delay table.

use std::{
    any::Any,
    marker::PhantomData,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use chrono::Utc;
use futures_util::{future::BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{
    config::TransportConfiguration,
    error::Error,
    heartbeat::HeartBeatWorker,
    lease::Lease,
    message::{ClaimedMessage, QueueId, ReceivedMessage},
    monitor::sleep_or_cancel,
    store::MessageStore,
};

pub mod cancel;
pub mod pool;

pub use cancel::{ShutdownReport, WorkerCancellation};
use pool::IdleSignal;

/// Heartbeat problems seen while a handler runs.
#[derive(Debug, Default)]
pub struct HeartBeatStatus {
    error_count: AtomicUsize,
    last_error: Mutex<Option<String>>,
}

impl HeartBeatStatus {
    pub fn set_error(&self, error: impl Into<String>) {
        self.error_count.fetch_add(1, Ordering::AcqRel);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.into());
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Context handed to a handler with each message.
#[derive(Debug, Clone)]
pub struct WorkerNotification {
    worker_id: usize,
    queue_id: QueueId,
    stopping: CancellationToken,
    cancelled: CancellationToken,
    heartbeat: Arc<HeartBeatStatus>,
}

impl WorkerNotification {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    /// Fires when the consumer stops claiming new work.
    pub fn worker_stopping(&self) -> &CancellationToken {
        &self.stopping
    }

    /// Fires when running handlers are asked to give up.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancelled
    }

    pub fn heartbeat(&self) -> &HeartBeatStatus {
        &self.heartbeat
    }
}

/// Processes one message. Returning an error triggers the retry policy.
pub trait MessageHandler<T>: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        message: &'a ReceivedMessage<T>,
        notification: &'a WorkerNotification,
    ) -> BoxFuture<'a, eyre::Result<()>>;
}

impl<T, F> MessageHandler<T> for F
where
    T: Sync,
    F: Fn(&ReceivedMessage<T>, &WorkerNotification) -> eyre::Result<()> + Send + Sync + 'static,
{
    fn handle<'a>(
        &'a self,
        message: &'a ReceivedMessage<T>,
        notification: &'a WorkerNotification,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        let result = self(message, notification);
        Box::pin(std::future::ready(result))
    }
}

pub(crate) struct Worker<S, T, H> {
    id: usize,
    store: Arc<S>,
    handler: Arc<H>,
    config: Arc<TransportConfiguration>,
    heartbeat: Option<HeartBeatWorker<S>>,
    tokens: WorkerCancellation,
    idle: IdleSignal,
    _body: PhantomData<fn() -> T>,
}

impl<S, T, H> Worker<S, T, H>
where
    S: MessageStore,
    T: DeserializeOwned + Send + Sync + 'static,
    H: MessageHandler<T>,
{
    pub(crate) fn new(
        id: usize,
        store: Arc<S>,
        handler: Arc<H>,
        config: Arc<TransportConfiguration>,
        heartbeat: Option<HeartBeatWorker<S>>,
        tokens: WorkerCancellation,
        idle: IdleSignal,
    ) -> Self {
        Self {
            id,
            store,
            handler,
            config,
            heartbeat,
            tokens,
            idle,
            _body: PhantomData,
        }
    }

    #[tracing::instrument(name = "worker", skip_all, fields(worker_id = self.id))]
    pub(crate) async fn run(self) {
        let stop = self.tokens.stop_token().clone();
        let mut empty = 0;
        let mut fatal = 0;

        tracing::debug!("worker started");

        while !stop.is_cancelled() {
            if !self.idle.wait_for_work(self.id, &stop).await {
                break;
            }

            let outcome = match self.store.receive(Utc::now()).await {
                Ok(Some(claimed)) => {
                    empty = 0;
                    self.idle.set_idle(false);
                    self.process(claimed).await
                }
                Ok(None) => {
                    self.idle.set_idle(true);
                    let delay = self.config.queue_delay().get(empty);
                    empty = empty.saturating_add(1);
                    if !sleep_or_cancel(delay, &stop).await {
                        break;
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => fatal = 0,
                Err(e) => {
                    tracing::error!(error = %e, "worker loop failed");
                    let delay = self.config.fatal_exception_delay().get(fatal);
                    fatal = fatal.saturating_add(1);
                    if !sleep_or_cancel(delay, &stop).await {
                        break;
                    }
                }
            }
        }

        tracing::debug!("worker stopped");
    }

    /// Runs the handler on one claimed message and settles the outcome. Errors are
    /// failures of the settling path itself.
    async fn process(&self, claimed: ClaimedMessage) -> Result<(), Error> {
        let queue_id = claimed.queue_id;

        let body = match claimed.codec.decode::<T>(&claimed.body) {
            Ok(body) => body,
            Err(source) => {
                let report = eyre::Report::new(Error::PoisonMessage {
                    queue_id,
                    source: Box::new(source),
                });
                tracing::error!(%queue_id, error = %format!("{report:#}"), "poison message");
                return self
                    .store
                    .move_to_error(queue_id, &format!("{report:#}"))
                    .await
                    .map(|_| ())
                    .map_err(|e| Error::ErrorHandlerCrashed {
                        queue_id,
                        source: Box::new(e),
                    });
            }
        };

        let lease = Arc::new(Lease::new(queue_id, claimed.lease));
        let status = Arc::new(HeartBeatStatus::default());
        let notification = WorkerNotification {
            worker_id: self.id,
            queue_id,
            stopping: self.tokens.stop_token().clone(),
            cancelled: self.tokens.cancel_token().clone(),
            heartbeat: status.clone(),
        };
        let message = ReceivedMessage {
            queue_id,
            correlation_id: claimed.correlation_id,
            body,
            headers: claimed.headers,
            queued_at: claimed.queued_at,
        };

        let guard = self
            .heartbeat
            .as_ref()
            .map(|heartbeat| heartbeat.start(lease.clone(), status));

        // The call itself sits inside the future so a handler that panics before
        // returning its future is caught too.
        let result = match AssertUnwindSafe(async {
            self.handler.handle(&message, &notification).await
        })
        .catch_unwind()
        .await
        {
            Ok(result) => result,
            Err(payload) => {
                let report = eyre::eyre!("handler panicked: {}", panic_message(&*payload));
                tracing::error!(%queue_id, error = %report, "handler panicked");
                Err(report)
            }
        };

        if let Some(guard) = guard {
            guard.stop().await;
        }

        match result {
            Ok(()) => {
                match self.store.commit(queue_id).await {
                    Ok(_) => tracing::debug!(%queue_id, "committed message"),
                    Err(e) => tracing::error!(
                        %queue_id,
                        error = %e,
                        "commit failed, message will be recovered once its lease is stale"
                    ),
                }
                Ok(())
            }
            Err(report) => self
                .settle_failure(&lease, report)
                .await
                .map_err(|e| Error::ErrorHandlerCrashed {
                    queue_id,
                    source: Box::new(e),
                }),
        }
    }

    async fn settle_failure(&self, lease: &Lease, report: eyre::Report) -> Result<(), Error> {
        let queue_id = lease.queue_id();
        let retry = self.config.retry().retry_amount(&report);
        let key = retry.tracking_key();

        let failures = if retry.max_retries > 0 {
            self.store.error_retry_count(queue_id, key).await? as usize
        } else {
            0
        };

        match retry.delay_for(failures) {
            Some(delay) => {
                let released = self
                    .store
                    .rollback(queue_id, Some(lease.current()), Some(delay))
                    .await?;

                // A lost lease means another consumer owns the message now and
                // this attempt does not count against its schedule.
                if released {
                    self.store.increment_error_count(queue_id, key).await?;
                    tracing::warn!(
                        %queue_id,
                        attempt = failures + 1,
                        max_retries = retry.max_retries,
                        ?delay,
                        error = %format!("{report:#}"),
                        "handler failed, message will be retried"
                    );
                } else {
                    tracing::warn!(%queue_id, "lease changed before rollback");
                }
            }
            None => {
                let moved = self
                    .store
                    .move_to_error(queue_id, &format!("{report:#}"))
                    .await?;

                if moved {
                    tracing::warn!(
                        %queue_id,
                        error = %format!("{report:#}"),
                        "handler failed, message moved to the error table"
                    );
                } else {
                    tracing::warn!(%queue_id, "message changed before it could be moved to the error table");
                }
            }
        }

        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
