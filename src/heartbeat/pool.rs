//! A small bounded pool dedicated to heartbeat work.
//!
//! Kept apart from the worker pool so that lease renewal keeps running when every
//! worker is busy inside a handler. `threads_min` runners are started eagerly;
//! more are added up to `threads_max` while the queue is backlogged, and runners
//! above the minimum exit after sitting idle for `thread_idle_timeout`.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use futures_util::FutureExt as _;
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
};

use crate::{config::HeartBeatThreadPoolConfiguration, error::Error};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

type SharedReceiver = Arc<AsyncMutex<mpsc::Receiver<Job>>>;

const QUEUE_DEPTH_PER_THREAD: usize = 16;

#[derive(Clone)]
pub struct HeartBeatThreadPool {
    inner: Arc<Inner>,
}

struct Inner {
    config: HeartBeatThreadPoolConfiguration,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: Mutex<Option<SharedReceiver>>,
    runners: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicUsize,
    busy: AtomicUsize,
    started: AtomicBool,
    disposed: AtomicBool,
}

/// What happened to the pool's runners on dispose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolShutdown {
    pub finished: usize,
    pub abandoned: usize,
}

impl HeartBeatThreadPool {
    pub fn new(config: HeartBeatThreadPoolConfiguration) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sender: Mutex::new(None),
                receiver: Mutex::new(None),
                runners: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn start(&self) -> Result<(), Error> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::disposed("heartbeat thread pool"));
        }
        self.inner.config.validate()?;
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::already_started("heartbeat thread pool"));
        }

        let depth = self.inner.config.threads_max() * QUEUE_DEPTH_PER_THREAD;
        let (tx, rx) = mpsc::channel(depth);
        let rx = Arc::new(AsyncMutex::new(rx));

        *lock(&self.inner.sender) = Some(tx);
        *lock(&self.inner.receiver) = Some(rx.clone());

        for _ in 0..self.inner.config.threads_min() {
            self.spawn_runner(rx.clone());
        }

        tracing::debug!(
            threads_min = self.inner.config.threads_min(),
            threads_max = self.inner.config.threads_max(),
            "heartbeat thread pool started"
        );
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire) && !self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn running_threads(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Queues work. Waits while the queue is full.
    pub async fn queue_work<F>(&self, work: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::disposed("heartbeat thread pool"));
        }
        let sender = lock(&self.inner.sender)
            .clone()
            .ok_or_else(|| Error::not_started("heartbeat thread pool"))?;

        sender
            .send(Box::pin(work))
            .await
            .map_err(|_| Error::disposed("heartbeat thread pool"))?;

        self.grow_if_backlogged();
        Ok(())
    }

    /// Must run after the send: a runner that retires concurrently either lowers
    /// `running` before this check or sees the job when it looks at the queue.
    fn grow_if_backlogged(&self) {
        let running = self.inner.running.load(Ordering::Acquire);
        let busy = self.inner.busy.load(Ordering::Acquire);
        if busy < running || running >= self.inner.config.threads_max() {
            return;
        }
        if let Some(rx) = lock(&self.inner.receiver).clone() {
            self.spawn_runner(rx);
        }
    }

    fn spawn_runner(&self, rx: SharedReceiver) {
        self.inner.running.fetch_add(1, Ordering::AcqRel);
        let inner = self.inner.clone();
        let handle = tokio::spawn(run(inner, rx));

        let mut runners = lock(&self.inner.runners);
        runners.retain(|h| !h.is_finished());
        runners.push(handle);
    }

    /// Stops accepting work, waits up to `wait_for_thread_pool_to_finish` for
    /// queued and in-flight work, then abandons whatever is still running.
    pub async fn dispose(&self) -> PoolShutdown {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return PoolShutdown::default();
        }

        lock(&self.inner.sender).take();
        lock(&self.inner.receiver).take();
        let runners = std::mem::take(&mut *lock(&self.inner.runners));

        let wait = self.inner.config.wait_for_thread_pool_to_finish();
        let deadline = tokio::time::Instant::now() + wait;

        let mut report = PoolShutdown::default();
        for mut handle in runners {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => report.finished += 1,
                Err(_) => {
                    handle.abort();
                    report.abandoned += 1;
                }
            }
        }

        if report.abandoned > 0 {
            tracing::warn!(
                abandoned = report.abandoned,
                "heartbeat thread pool did not finish in time"
            );
        }
        report
    }
}

async fn run(inner: Arc<Inner>, rx: SharedReceiver) {
    let idle = inner.config.thread_idle_timeout();
    let min = inner.config.threads_min();
    let max = inner.config.threads_max();

    loop {
        let next = tokio::time::timeout(idle, async { rx.lock().await.recv().await }).await;

        match next {
            Ok(Some(job)) => {
                inner.busy.fetch_add(1, Ordering::AcqRel);
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    tracing::error!("heartbeat work panicked");
                }
                inner.busy.fetch_sub(1, Ordering::AcqRel);
            }
            Ok(None) => break,
            Err(_) => {
                let running = inner.running.load(Ordering::Acquire);
                if running > min
                    && inner
                        .running
                        .compare_exchange(running, running - 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    // Work queued while retiring may have seen this runner as idle
                    // and spawned nobody. Stay unless the pool is full again.
                    let backlog = !rx.lock().await.is_empty();
                    if backlog
                        && inner
                            .running
                            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                                (n < max).then_some(n + 1)
                            })
                            .is_ok()
                    {
                        continue;
                    }
                    return;
                }
            }
        }
    }

    inner.running.fetch_sub(1, Ordering::AcqRel);
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
