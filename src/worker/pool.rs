//! The fixed set of worker tasks of one consumer.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use super::{MessageHandler, ShutdownReport, Worker, WorkerCancellation};
use crate::{
    config::{TransportConfiguration, WorkerConfiguration},
    heartbeat::HeartBeatWorker,
    store::MessageStore,
};

/// Lets a single worker poll an empty queue while the others wait.
///
/// Worker 0 always polls. The rest wait while the queue is marked idle and are
/// woken as soon as any worker claims a message.
#[derive(Clone)]
pub(crate) struct IdleSignal {
    enabled: bool,
    idle: Arc<watch::Sender<bool>>,
}

impl IdleSignal {
    pub(crate) fn new(enabled: bool) -> Self {
        let (idle, _) = watch::channel(false);
        Self {
            enabled,
            idle: Arc::new(idle),
        }
    }

    pub(crate) fn set_idle(&self, idle: bool) {
        if !self.enabled {
            return;
        }
        self.idle.send_if_modified(|current| {
            if *current == idle {
                return false;
            }
            *current = idle;
            true
        });
    }

    /// Returns false if `stop` fired while waiting.
    pub(crate) async fn wait_for_work(&self, worker_id: usize, stop: &CancellationToken) -> bool {
        if !self.enabled || worker_id == 0 {
            return true;
        }

        let mut rx = self.idle.subscribe();
        tokio::select! {
            _ = stop.cancelled() => false,
            woken = async { rx.wait_for(|idle| !*idle).await.is_ok() } => woken,
        }
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        *self.idle.borrow()
    }
}

pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    tokens: WorkerCancellation,
    config: WorkerConfiguration,
}

impl WorkerPool {
    pub(crate) fn start<S, T, H>(
        config: WorkerConfiguration,
        transport: Arc<TransportConfiguration>,
        store: Arc<S>,
        handler: Arc<H>,
        heartbeat: Option<HeartBeatWorker<S>>,
    ) -> Self
    where
        S: MessageStore,
        T: DeserializeOwned + Send + Sync + 'static,
        H: MessageHandler<T>,
    {
        let tokens = WorkerCancellation::new();
        let idle = IdleSignal::new(config.single_worker_when_no_work_found());

        let handles = (0..config.worker_count())
            .map(|id| {
                let worker: Worker<S, T, H> = Worker::new(
                    id,
                    store.clone(),
                    handler.clone(),
                    transport.clone(),
                    heartbeat.clone(),
                    tokens.clone(),
                    idle.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        tracing::info!(workers = config.worker_count(), "worker pool started");

        Self {
            handles,
            tokens,
            config,
        }
    }

    pub(crate) fn tokens(&self) -> &WorkerCancellation {
        &self.tokens
    }

    pub(crate) fn running(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Stop, then cancel, then optionally abort, waiting the configured time after
    /// each of the first two signals.
    pub(crate) async fn shutdown(self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        self.tokens.stop();
        let deadline = Instant::now() + self.config.time_to_wait_for_workers_to_stop();
        let (stopped, pending) = wait_until(self.handles, deadline).await;
        report.stopped = stopped;

        self.tokens.cancel();
        if pending.is_empty() {
            return report;
        }

        tracing::warn!(
            pending = pending.len(),
            "workers did not stop in time, cancelling handlers"
        );
        let deadline = Instant::now() + self.config.time_to_wait_for_workers_to_cancel();
        let (cancelled, pending) = wait_until(pending, deadline).await;
        report.cancelled = cancelled;

        if pending.is_empty() {
            return report;
        }

        if self.config.abort_worker_threads_when_stopping() {
            tracing::warn!(workers = pending.len(), "aborting workers");
            for handle in &pending {
                handle.abort();
            }
            report.aborted = pending.len();
        } else {
            tracing::warn!(workers = pending.len(), "abandoning workers that did not stop");
            report.abandoned = pending.len();
        }

        report
    }
}

async fn wait_until(
    handles: Vec<JoinHandle<()>>,
    deadline: Instant,
) -> (usize, Vec<JoinHandle<()>>) {
    let mut finished = 0;
    let mut pending = Vec::new();

    for mut handle in handles {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Err(e)) if e.is_panic() => {
                tracing::error!("worker panicked");
                finished += 1;
            }
            Ok(_) => finished += 1,
            Err(_) => pending.push(handle),
        }
    }

    (finished, pending)
}
