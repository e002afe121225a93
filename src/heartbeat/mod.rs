//! Lease renewal for in-flight messages and recovery of abandoned ones.
//!
//! Both activities run on the dedicated [`HeartBeatThreadPool`]. Renewal never
//! interrupts a handler: a lost lease is recorded on the handler's
//! [`HeartBeatStatus`] and the handler decides whether to give up.

use std::sync::Arc;

use chrono::Utc;
use rand::{rngs::StdRng, SeedableRng};
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::HeartBeatConfiguration,
    delay::DelayPolicy,
    error::Error,
    lease::{reset_stale_leases, Lease},
    message::QueueId,
    store::MessageStore,
    worker::HeartBeatStatus,
};

pub mod expression;
pub mod pool;

use expression::UpdateTime;
use pool::HeartBeatThreadPool;

/// Renews the leases held by this process.
pub struct HeartBeatWorker<S> {
    store: Arc<S>,
    pool: HeartBeatThreadPool,
    update: UpdateTime,
    active: Arc<papaya::HashMap<QueueId, Arc<Lease>>>,
}

impl<S> Clone for HeartBeatWorker<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            pool: self.pool.clone(),
            update: self.update,
            active: self.active.clone(),
        }
    }
}

/// Stops renewing one lease when [`HeartBeatGuard::stop`] is awaited.
pub struct HeartBeatGuard {
    token: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

impl HeartBeatGuard {
    /// Returns once no renewal for this lease is in flight, so the caller can rely
    /// on the lease value it reads afterwards.
    pub async fn stop(mut self) {
        self.token.cancel();
        let Some(timer) = self.timer.take() else {
            return;
        };
        if let Err(e) = timer.await {
            if e.is_panic() {
                tracing::error!("heartbeat timer panicked");
            }
        }
    }
}

impl Drop for HeartBeatGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl<S: MessageStore> HeartBeatWorker<S> {
    pub fn new(store: Arc<S>, pool: HeartBeatThreadPool, update: UpdateTime) -> Self {
        Self {
            store,
            pool,
            update,
            active: Arc::new(papaya::HashMap::new()),
        }
    }

    /// Number of leases currently being renewed.
    pub fn active_leases(&self) -> usize {
        self.active.len()
    }

    pub fn start(&self, lease: Arc<Lease>, status: Arc<HeartBeatStatus>) -> HeartBeatGuard {
        let token = CancellationToken::new();
        self.active.pin().insert(lease.queue_id(), lease.clone());

        let timer = tokio::spawn(self.clone().run(lease, status, token.clone()));
        HeartBeatGuard {
            token,
            timer: Some(timer),
        }
    }

    async fn run(self, lease: Arc<Lease>, status: Arc<HeartBeatStatus>, token: CancellationToken) {
        let queue_id = lease.queue_id();
        let mut rng = StdRng::from_entropy();

        loop {
            let delay = self.update.next_delay(&mut rng);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let (done, finished) = oneshot::channel();
            let work = {
                let store = self.store.clone();
                let lease = lease.clone();
                let status = status.clone();
                let token = token.clone();
                async move {
                    match lease.renew(&*store, Utc::now()).await {
                        Ok(true) => tracing::trace!(%queue_id, "renewed lease"),
                        Ok(false) if token.is_cancelled() => {}
                        Ok(false) => {
                            tracing::warn!(%queue_id, "lease lost while processing");
                            status.set_error(format!("lease on message {queue_id} was lost"));
                        }
                        Err(e) => {
                            tracing::error!(%queue_id, error = %e, "failed to renew lease");
                            status.set_error(e.to_string());
                        }
                    }
                    let _ = done.send(());
                }
            };

            if let Err(e) = self.pool.queue_work(work).await {
                tracing::error!(%queue_id, error = %e, "could not schedule lease renewal");
                status.set_error(e.to_string());
                break;
            }

            let _ = finished.await;
            if lease.is_lost() {
                break;
            }
        }

        self.active.pin().remove(&queue_id);
    }
}

/// Periodically returns messages with stale leases to the queue.
pub struct HeartBeatMonitor<S> {
    store: Arc<S>,
    pool: HeartBeatThreadPool,
    config: HeartBeatConfiguration,
    fatal_delay: DelayPolicy,
}

impl<S: MessageStore> HeartBeatMonitor<S> {
    pub fn new(
        store: Arc<S>,
        pool: HeartBeatThreadPool,
        config: HeartBeatConfiguration,
        fatal_delay: DelayPolicy,
    ) -> Self {
        Self {
            store,
            pool,
            config,
            fatal_delay,
        }
    }

    /// Runs one scan on the heartbeat pool. Returns the number of messages reset.
    pub async fn reset_expired(&self) -> Result<u64, Error> {
        let (done, result) = oneshot::channel();
        let store = self.store.clone();
        let older_than = Utc::now() - self.config.time();

        self.pool
            .queue_work(async move {
                let _ = done.send(reset_stale_leases(&*store, older_than).await);
            })
            .await?;

        match result.await {
            Ok(Ok(reset)) => Ok(reset.len() as u64),
            Ok(Err(e)) if e.is_missing_table() => Ok(0),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::disposed("heartbeat thread pool")),
        }
    }

    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        let interval = self.config.monitor_time();
        let fatal_delay = self.fatal_delay.clone();
        let monitor = Arc::new(self);

        crate::monitor::spawn("heartbeat", interval, fatal_delay, stop, move |_| {
            let monitor = monitor.clone();
            async move { monitor.reset_expired().await }
        })
    }
}
