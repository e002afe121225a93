//! Configuration.
//!
//! [`Config`] is the process-level configuration read from `RELAYQ_*` environment
//! variables. The remaining types configure a consumer queue. They are mutable
//! until locked with `set_read_only`, which [`crate::queue::ConsumerQueue::start`]
//! does; the lock is irreversible and every setter afterwards returns
//! [`Error::ReadOnly`].

use std::time::Duration;

use serde::Deserialize;

use crate::{
    delay::DelayPolicy, error::Error, heartbeat::expression::UpdateTime, retry::RetryPolicy,
};

#[derive(Clone, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
    pub queue: Option<String>,
    pub workers: Option<usize>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("RELAYQ_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("relayq.db")
    }

    pub fn queue(&self) -> &str {
        self.queue.as_deref().unwrap_or("default")
    }

    pub fn workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            queue: None,
            workers: None,
        }
    }
}

macro_rules! settings {
    ($ty:ident, $what:literal, { $($field:ident: $fty:ty => $setter:ident),* $(,)? }) => {
        impl $ty {
            $(
                pub fn $field(&self) -> $fty {
                    self.$field.clone()
                }

                pub fn $setter(&mut self, value: $fty) -> Result<(), Error> {
                    if self.read_only {
                        return Err(Error::read_only($what));
                    }
                    self.$field = value;
                    Ok(())
                }
            )*

            pub fn is_read_only(&self) -> bool {
                self.read_only
            }
        }
    };
}

#[derive(Debug, Clone)]
pub struct WorkerConfiguration {
    worker_count: usize,
    single_worker_when_no_work_found: bool,
    time_to_wait_for_workers_to_stop: Duration,
    time_to_wait_for_workers_to_cancel: Duration,
    /// Last resort. Aborting a worker mid-handler leaves its message claimed until
    /// the lease goes stale.
    abort_worker_threads_when_stopping: bool,
    read_only: bool,
}

settings!(WorkerConfiguration, "worker configuration", {
    worker_count: usize => set_worker_count,
    single_worker_when_no_work_found: bool => set_single_worker_when_no_work_found,
    time_to_wait_for_workers_to_stop: Duration => set_time_to_wait_for_workers_to_stop,
    time_to_wait_for_workers_to_cancel: Duration => set_time_to_wait_for_workers_to_cancel,
    abort_worker_threads_when_stopping: bool => set_abort_worker_threads_when_stopping,
});

impl Default for WorkerConfiguration {
    fn default() -> Self {
        Self {
            worker_count: 1,
            single_worker_when_no_work_found: true,
            time_to_wait_for_workers_to_stop: Duration::from_secs(10),
            time_to_wait_for_workers_to_cancel: Duration::from_secs(5),
            abort_worker_threads_when_stopping: false,
            read_only: false,
        }
    }
}

impl WorkerConfiguration {
    pub fn validate(&self) -> Result<(), Error> {
        if self.worker_count == 0 {
            return Err(Error::invalid_argument("worker_count must be at least 1"));
        }
        Ok(())
    }

    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }
}

#[derive(Debug, Clone)]
pub struct HeartBeatThreadPoolConfiguration {
    threads_min: usize,
    threads_max: usize,
    thread_idle_timeout: Duration,
    wait_for_thread_pool_to_finish: Duration,
    read_only: bool,
}

settings!(HeartBeatThreadPoolConfiguration, "heartbeat thread pool configuration", {
    threads_min: usize => set_threads_min,
    threads_max: usize => set_threads_max,
    thread_idle_timeout: Duration => set_thread_idle_timeout,
    wait_for_thread_pool_to_finish: Duration => set_wait_for_thread_pool_to_finish,
});

impl Default for HeartBeatThreadPoolConfiguration {
    fn default() -> Self {
        Self {
            threads_min: 0,
            threads_max: 1,
            thread_idle_timeout: Duration::from_secs(60),
            wait_for_thread_pool_to_finish: Duration::from_secs(5),
            read_only: false,
        }
    }
}

impl HeartBeatThreadPoolConfiguration {
    pub fn validate(&self) -> Result<(), Error> {
        if self.threads_max == 0 {
            return Err(Error::invalid_argument("threads_max must be at least 1"));
        }
        if self.threads_min > self.threads_max {
            return Err(Error::invalid_argument(
                "threads_min must not exceed threads_max",
            ));
        }
        Ok(())
    }

    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }
}

#[derive(Debug, Clone)]
pub struct HeartBeatConfiguration {
    enabled: bool,
    /// A lease older than this is considered abandoned.
    time: Duration,
    /// How often to scan for abandoned leases.
    monitor_time: Duration,
    /// When to renew the leases held by this process.
    update_time: String,
    thread_pool: HeartBeatThreadPoolConfiguration,
    read_only: bool,
}

settings!(HeartBeatConfiguration, "heartbeat configuration", {
    enabled: bool => set_enabled,
    time: Duration => set_time,
    monitor_time: Duration => set_monitor_time,
    update_time: String => set_update_time,
});

impl Default for HeartBeatConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            time: Duration::from_secs(600),
            monitor_time: Duration::from_secs(60),
            update_time: "sec(*%60)~10".to_owned(),
            thread_pool: HeartBeatThreadPoolConfiguration::default(),
            read_only: false,
        }
    }
}

impl HeartBeatConfiguration {
    pub fn thread_pool(&self) -> &HeartBeatThreadPoolConfiguration {
        &self.thread_pool
    }

    pub fn thread_pool_mut(&mut self) -> Result<&mut HeartBeatThreadPoolConfiguration, Error> {
        if self.read_only {
            return Err(Error::read_only("heartbeat configuration"));
        }
        Ok(&mut self.thread_pool)
    }

    pub fn parsed_update_time(&self) -> Result<UpdateTime, Error> {
        self.update_time.parse()
    }

    /// Renewal must be able to happen at least once before a lease is judged stale.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.enabled {
            return Ok(());
        }
        let update = self.parsed_update_time()?;
        if update.max_interval() >= self.time {
            return Err(Error::invalid_argument(format!(
                "heartbeat update interval {:?} must be shorter than the heartbeat time {:?}",
                update.max_interval(),
                self.time
            )));
        }
        self.thread_pool.validate()
    }

    pub fn set_read_only(&mut self) {
        self.read_only = true;
        self.thread_pool.set_read_only();
    }
}

#[derive(Debug, Clone)]
pub struct MessageExpirationConfiguration {
    enabled: bool,
    monitor_time: Duration,
    read_only: bool,
}

settings!(MessageExpirationConfiguration, "message expiration configuration", {
    enabled: bool => set_enabled,
    monitor_time: Duration => set_monitor_time,
});

impl Default for MessageExpirationConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            monitor_time: Duration::from_secs(60),
            read_only: false,
        }
    }
}

impl MessageExpirationConfiguration {
    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }
}

#[derive(Debug, Clone)]
pub struct MessageErrorConfiguration {
    enabled: bool,
    message_age: Duration,
    monitor_time: Duration,
    read_only: bool,
}

settings!(MessageErrorConfiguration, "message error configuration", {
    enabled: bool => set_enabled,
    message_age: Duration => set_message_age,
    monitor_time: Duration => set_monitor_time,
});

impl Default for MessageErrorConfiguration {
    fn default() -> Self {
        Self {
            enabled: false,
            message_age: Duration::from_secs(30 * 24 * 60 * 60),
            monitor_time: Duration::from_secs(60 * 60),
            read_only: false,
        }
    }
}

impl MessageErrorConfiguration {
    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }
}

#[derive(Debug, Clone)]
pub struct QueueStatusConfiguration {
    enabled: bool,
    monitor_time: Duration,
    read_only: bool,
}

settings!(QueueStatusConfiguration, "queue status configuration", {
    enabled: bool => set_enabled,
    monitor_time: Duration => set_monitor_time,
});

impl Default for QueueStatusConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            monitor_time: Duration::from_secs(30),
            read_only: false,
        }
    }
}

impl QueueStatusConfiguration {
    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }
}

/// Accessors for a configuration built out of lockable sections. A section can be
/// replaced or borrowed mutably only while the owner is unlocked, so a locked
/// section is never swapped for an unlocked one.
macro_rules! sections {
    ($ty:ident, $what:literal, { $($field:ident: $fty:ty => $field_mut:ident, $setter:ident),* $(,)? }) => {
        impl $ty {
            $(
                pub fn $field(&self) -> &$fty {
                    &self.$field
                }

                pub fn $field_mut(&mut self) -> Result<&mut $fty, Error> {
                    if self.read_only {
                        return Err(Error::read_only($what));
                    }
                    Ok(&mut self.$field)
                }

                pub fn $setter(&mut self, value: $fty) -> Result<(), Error> {
                    *self.$field_mut()? = value;
                    Ok(())
                }
            )*

            pub fn is_read_only(&self) -> bool {
                self.read_only
            }
        }
    };
}

/// Everything the worker and monitor loops consult at runtime.
#[derive(Debug, Clone)]
pub struct TransportConfiguration {
    retry: RetryPolicy,
    queue_delay: DelayPolicy,
    fatal_exception_delay: DelayPolicy,
    heartbeat: HeartBeatConfiguration,
    message_expiration: MessageExpirationConfiguration,
    message_error: MessageErrorConfiguration,
    read_only: bool,
}

sections!(TransportConfiguration, "transport configuration", {
    retry: RetryPolicy => retry_mut, set_retry,
    queue_delay: DelayPolicy => queue_delay_mut, set_queue_delay,
    fatal_exception_delay: DelayPolicy => fatal_exception_delay_mut, set_fatal_exception_delay,
    heartbeat: HeartBeatConfiguration => heartbeat_mut, set_heartbeat,
    message_expiration: MessageExpirationConfiguration => message_expiration_mut, set_message_expiration,
    message_error: MessageErrorConfiguration => message_error_mut, set_message_error,
});

impl Default for TransportConfiguration {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(),
            queue_delay: DelayPolicy::default_queue_delay(),
            fatal_exception_delay: DelayPolicy::default_fatal_exception_delay(),
            heartbeat: HeartBeatConfiguration::default(),
            message_expiration: MessageExpirationConfiguration::default(),
            message_error: MessageErrorConfiguration::default(),
            read_only: false,
        }
    }
}

impl TransportConfiguration {
    pub fn set_read_only(&mut self) {
        self.read_only = true;
        self.retry.set_read_only();
        self.queue_delay.set_read_only();
        self.fatal_exception_delay.set_read_only();
        self.heartbeat.set_read_only();
        self.message_expiration.set_read_only();
        self.message_error.set_read_only();
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsumerConfiguration {
    worker: WorkerConfiguration,
    transport: TransportConfiguration,
    status: QueueStatusConfiguration,
    read_only: bool,
}

sections!(ConsumerConfiguration, "consumer configuration", {
    worker: WorkerConfiguration => worker_mut, set_worker,
    transport: TransportConfiguration => transport_mut, set_transport,
    status: QueueStatusConfiguration => status_mut, set_status,
});

impl ConsumerConfiguration {
    pub fn validate(&self) -> Result<(), Error> {
        self.worker.validate()?;
        self.transport.heartbeat.validate()
    }

    pub fn set_read_only(&mut self) {
        self.read_only = true;
        self.worker.set_read_only();
        self.transport.set_read_only();
        self.status.set_read_only();
    }
}
