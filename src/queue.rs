//! Producer and consumer surfaces of a queue.

use std::{marker::PhantomData, sync::Arc};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{de::DeserializeOwned, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConsumerConfiguration,
    error::Error,
    heartbeat::{pool::HeartBeatThreadPool, HeartBeatMonitor, HeartBeatWorker},
    message::{
        AdditionalMessageData, JobMetadata, Message, MessageCodec, OutboundMessage, SentMessage,
    },
    monitor::{self, StatusSnapshot},
    store::{MessageStore, QueueStatus},
    worker::{pool::WorkerPool, MessageHandler, ShutdownReport},
};

/// Sends messages of type `T`.
pub struct ProducerQueue<S, T> {
    store: Arc<S>,
    codec: MessageCodec,
    _body: PhantomData<fn(T)>,
}

impl<S: MessageStore, T: Serialize + Sync> ProducerQueue<S, T> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            codec: MessageCodec::default(),
            _body: PhantomData,
        }
    }

    pub fn with_codec(mut self, codec: MessageCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn outbound(
        &self,
        message: &Message<T>,
        data: &AdditionalMessageData,
    ) -> Result<OutboundMessage, Error> {
        let mut headers = message.headers.clone();
        headers.extend(&data.headers);

        let delay = data.resolve_delay(&message.headers);
        let expiration = data.resolve_expiration(&message.headers);
        if let Some(delay) = delay {
            headers.set_delay(delay);
        }
        if let Some(expiration) = expiration {
            headers.set_expiration(expiration);
        }

        Ok(OutboundMessage {
            correlation_id: data.correlation_id_or_new(),
            body: self.codec.encode(&message.body)?,
            codec: self.codec,
            headers,
            delay,
            expiration,
        })
    }

    pub async fn send(
        &self,
        message: &Message<T>,
        data: &AdditionalMessageData,
    ) -> Result<SentMessage, Error> {
        let outbound = self.outbound(message, data)?;
        self.store.send(outbound, None).await
    }

    /// Sends every message independently. The outer error is reserved for
    /// failures that affect the whole batch, such as an unreachable store; each
    /// message's own outcome is in the returned list, in input order.
    pub async fn send_batch(
        &self,
        messages: &[(Message<T>, AdditionalMessageData)],
    ) -> Result<Vec<Result<SentMessage, Error>>, Error> {
        self.store.ping().await?;

        Ok(join_all(messages.iter().map(|(message, data)| self.send(message, data))).await)
    }

    /// Sends a job message. A job is queued at most once per scheduled time; a
    /// second send for the same time fails with [`Error::JobAlreadyQueued`].
    pub async fn send_job(
        &self,
        job_name: impl Into<String>,
        scheduled_time: DateTime<Utc>,
        event_time: DateTime<Utc>,
        message: &Message<T>,
    ) -> Result<SentMessage, Error> {
        let job = JobMetadata {
            job_name: job_name.into(),
            scheduled_time,
            event_time,
        };
        let outbound = self.outbound(message, &AdditionalMessageData::new())?;
        self.store.send(outbound, Some(job)).await
    }

    pub async fn last_job_event_time(
        &self,
        job_name: &str,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        self.store.last_job_event_time(job_name).await
    }
}

struct Running<S> {
    workers: WorkerPool,
    heartbeat_pool: Option<HeartBeatThreadPool>,
    heartbeat: Option<HeartBeatWorker<S>>,
    monitors: Vec<JoinHandle<()>>,
    monitor_stop: CancellationToken,
}

/// Consumes messages of type `T` with handler `H`.
pub struct ConsumerQueue<S, T, H> {
    store: Arc<S>,
    handler: Arc<H>,
    configuration: ConsumerConfiguration,
    status: StatusSnapshot,
    running: Option<Running<S>>,
    started: bool,
    disposed: bool,
    _body: PhantomData<fn() -> T>,
}

#[bon::bon]
impl<S, T, H> ConsumerQueue<S, T, H>
where
    S: MessageStore,
    T: DeserializeOwned + Send + Sync + 'static,
    H: MessageHandler<T>,
{
    #[builder]
    pub fn new(
        store: Arc<S>,
        handler: H,
        #[builder(default)] configuration: ConsumerConfiguration,
    ) -> Self {
        Self {
            store,
            handler: Arc::new(handler),
            configuration,
            status: StatusSnapshot::default(),
            running: None,
            started: false,
            disposed: false,
            _body: PhantomData,
        }
    }

    pub fn configuration(&self) -> &ConsumerConfiguration {
        &self.configuration
    }

    /// Fails with [`Error::ReadOnly`] once [`ConsumerQueue::start`] has locked the
    /// configuration.
    pub fn configuration_mut(&mut self) -> Result<&mut ConsumerConfiguration, Error> {
        if self.configuration.is_read_only() {
            return Err(Error::read_only("consumer configuration"));
        }
        Ok(&mut self.configuration)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn running_workers(&self) -> usize {
        self.running
            .as_ref()
            .map(|r| r.workers.running())
            .unwrap_or(0)
    }

    /// Leases currently renewed by this consumer.
    pub fn active_leases(&self) -> usize {
        self.running
            .as_ref()
            .and_then(|r| r.heartbeat.as_ref())
            .map(|h| h.active_leases())
            .unwrap_or(0)
    }

    /// The last counts read by the status monitor.
    pub fn status(&self) -> Option<(DateTime<Utc>, QueueStatus)> {
        self.status.get()
    }

    /// Validates and locks the configuration, then starts the heartbeat pool, the
    /// monitors and the workers.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.disposed {
            return Err(Error::disposed("consumer queue"));
        }
        if self.started {
            return Err(Error::already_started("consumer queue"));
        }

        self.configuration.validate()?;
        self.configuration.set_read_only();

        let transport = Arc::new(self.configuration.transport().clone());
        let fatal_delay = transport.fatal_exception_delay().clone();
        let monitor_stop = CancellationToken::new();
        let mut monitors = Vec::new();

        let (heartbeat_pool, heartbeat) = if transport.heartbeat().enabled() {
            let update = transport.heartbeat().parsed_update_time()?;
            let pool = HeartBeatThreadPool::new(transport.heartbeat().thread_pool().clone());
            pool.start()?;

            monitors.push(
                HeartBeatMonitor::new(
                    self.store.clone(),
                    pool.clone(),
                    transport.heartbeat().clone(),
                    fatal_delay.clone(),
                )
                .spawn(monitor_stop.clone()),
            );

            let worker = HeartBeatWorker::new(self.store.clone(), pool.clone(), update);
            (Some(pool), Some(worker))
        } else {
            (None, None)
        };

        if transport.message_expiration().enabled() {
            monitors.push(monitor::spawn_expiration(
                self.store.clone(),
                transport.message_expiration().monitor_time(),
                fatal_delay.clone(),
                monitor_stop.clone(),
            ));
        }

        if transport.message_error().enabled() {
            monitors.push(monitor::spawn_error_cleanup(
                self.store.clone(),
                transport.message_error().monitor_time(),
                transport.message_error().message_age(),
                fatal_delay.clone(),
                monitor_stop.clone(),
            ));
        }

        if self.configuration.status().enabled() {
            monitors.push(monitor::spawn_status(
                self.store.clone(),
                self.configuration.status().monitor_time(),
                fatal_delay,
                self.status.clone(),
                monitor_stop.clone(),
            ));
        }

        let workers = WorkerPool::start::<S, T, H>(
            self.configuration.worker().clone(),
            transport,
            self.store.clone(),
            self.handler.clone(),
            heartbeat.clone(),
        );

        self.running = Some(Running {
            workers,
            heartbeat_pool,
            heartbeat,
            monitors,
            monitor_stop,
        });
        self.started = true;

        tracing::info!("consumer queue started");
        Ok(())
    }

    /// Stops the workers, then the monitors and the heartbeat pool.
    pub async fn shutdown(&mut self) -> Result<ShutdownReport, Error> {
        if self.disposed {
            return Err(Error::disposed("consumer queue"));
        }
        let Some(running) = self.running.take() else {
            return Err(Error::not_started("consumer queue"));
        };

        let report = running.workers.shutdown().await;

        running.monitor_stop.cancel();
        let deadline = tokio::time::Instant::now()
            + self.configuration.worker().time_to_wait_for_workers_to_cancel();
        for mut monitor in running.monitors {
            if tokio::time::timeout_at(deadline, &mut monitor).await.is_err() {
                monitor.abort();
            }
        }

        if let Some(pool) = running.heartbeat_pool {
            pool.dispose().await;
        }

        tracing::info!(?report, "consumer queue stopped");
        Ok(report)
    }

    /// Shuts down if running. Every later call fails with [`Error::Disposed`].
    pub async fn dispose(&mut self) -> Option<ShutdownReport> {
        if self.disposed {
            return None;
        }
        let report = if self.running.is_some() {
            self.shutdown().await.ok()
        } else {
            None
        };
        self.disposed = true;
        report
    }
}

impl<S, T, H> Drop for ConsumerQueue<S, T, H> {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.workers.tokens().cancel();
            running.monitor_stop.cancel();
        }
    }
}
