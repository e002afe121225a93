use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::Utc;
use futures_util::future::BoxFuture;
use relayq::{
    config::{ConsumerConfiguration, WorkerConfiguration},
    delay::DelayPolicy,
    error::Error,
    lease::reset_stale_leases,
    AdditionalMessageData, ConsumerQueue, Message, MessageHandler, ProducerQueue, QueueId,
    ReceivedMessage, SqliteStore, WorkerNotification,
};

mod common;

use common::{eventually, setup, TmpStore, QUEUE};

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
struct Job {
    n: u32,
}

#[derive(Debug)]
struct InvalidOperation;

impl fmt::Display for InvalidOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid operation")
    }
}

impl std::error::Error for InvalidOperation {}

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> ConsumerConfiguration {
    let mut config = ConsumerConfiguration::default();
    let transport = config.transport_mut().unwrap();
    transport
        .set_queue_delay(DelayPolicy::new([Duration::from_millis(10)]))
        .unwrap();
    transport
        .set_fatal_exception_delay(DelayPolicy::new([Duration::from_millis(10)]))
        .unwrap();
    config
}

async fn send(store: &TmpStore, n: u32) -> QueueId {
    ProducerQueue::new(store.store.clone())
        .send(&Message::new(Job { n }), &AdditionalMessageData::new())
        .await
        .unwrap()
        .queue_id
}

/// Holds each message for `hold`, then records what the heartbeat reported.
struct SlowHandler {
    hold: Duration,
    heartbeat_errors: Arc<AtomicUsize>,
    last_heartbeat_error: Arc<Mutex<Option<String>>>,
}

impl SlowHandler {
    fn new(hold: Duration) -> Self {
        Self {
            hold,
            heartbeat_errors: Default::default(),
            last_heartbeat_error: Default::default(),
        }
    }
}

impl MessageHandler<Job> for SlowHandler {
    fn handle<'a>(
        &'a self,
        _message: &'a ReceivedMessage<Job>,
        notification: &'a WorkerNotification,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        Box::pin(async move {
            tokio::time::sleep(self.hold).await;
            self.heartbeat_errors
                .store(notification.heartbeat().error_count(), Ordering::SeqCst);
            *self.last_heartbeat_error.lock().unwrap() = notification.heartbeat().error();
            Ok(())
        })
    }
}

/// Waits for the cancellation signal before finishing.
struct CooperativeHandler;

impl MessageHandler<Job> for CooperativeHandler {
    fn handle<'a>(
        &'a self,
        _message: &'a ReceivedMessage<Job>,
        notification: &'a WorkerNotification,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        Box::pin(async move {
            notification.cancellation().cancelled().await;
            Ok(())
        })
    }
}

/// Never finishes.
struct StuckHandler;

impl MessageHandler<Job> for StuckHandler {
    fn handle<'a>(
        &'a self,
        _message: &'a ReceivedMessage<Job>,
        _notification: &'a WorkerNotification,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        Box::pin(std::future::pending())
    }
}

/// Moves the lease on, as a consumer that reclaimed the message would, then fails.
struct LeaseLosingHandler {
    store: Arc<SqliteStore>,
    attempts: Arc<AtomicUsize>,
}

impl MessageHandler<Job> for LeaseLosingHandler {
    fn handle<'a>(
        &'a self,
        message: &'a ReceivedMessage<Job>,
        _notification: &'a WorkerNotification,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            sqlx::query(&format!(
                "UPDATE {QUEUE}MetaData SET HeartBeat = HeartBeat + 1 WHERE QueueID = $1"
            ))
            .bind(message.queue_id)
            .execute(self.store.db().unwrap())
            .await?;
            Err(eyre::Report::new(InvalidOperation))
        })
    }
}

#[tokio::test]
async fn test_processes_and_commits() {
    let store = setup().await;
    for n in 0..3 {
        send(&store, n).await;
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler_seen = seen.clone();
    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(move |message: &ReceivedMessage<Job>, _: &WorkerNotification| -> eyre::Result<()> {
            handler_seen.lock().unwrap().push(message.body.n);
            Ok(())
        })
        .configuration(fast_config())
        .build();
    consumer.start().unwrap();

    assert!(eventually(WAIT, || async { seen.lock().unwrap().len() == 3 }).await);
    assert!(eventually(WAIT, || async { store.count("MetaData").await == 0 }).await);
    assert_eq!(store.count("").await, 0);

    // Claimed in queue order by a single worker.
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);

    let report = consumer.shutdown().await.unwrap();
    assert!(report.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_workers_process_each_message_once() {
    let store = setup().await;
    for n in 0..20 {
        send(&store, n).await;
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler_seen = seen.clone();
    let mut config = fast_config();
    let worker = config.worker_mut().unwrap();
    worker.set_worker_count(4).unwrap();
    worker.set_single_worker_when_no_work_found(false).unwrap();

    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(move |message: &ReceivedMessage<Job>, _: &WorkerNotification| -> eyre::Result<()> {
            handler_seen.lock().unwrap().push(message.body.n);
            Ok(())
        })
        .configuration(config)
        .build();
    consumer.start().unwrap();
    assert_eq!(consumer.running_workers(), 4);

    assert!(eventually(WAIT, || async { store.count("MetaData").await == 0 }).await);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 20);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 20);

    consumer.dispose().await;
}

#[tokio::test]
async fn test_retries_then_moves_to_error() {
    let store = setup().await;
    let queue_id = send(&store, 1).await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let handler_attempts = attempts.clone();
    let mut config = fast_config();
    config
        .transport_mut()
        .unwrap()
        .retry_mut()
        .unwrap()
        .register::<InvalidOperation>([Duration::from_secs(1), Duration::from_secs(3)])
        .unwrap();

    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(move |_: &ReceivedMessage<Job>, _: &WorkerNotification| -> eyre::Result<()> {
            handler_attempts.fetch_add(1, Ordering::SeqCst);
            Err(eyre::Report::new(InvalidOperation).wrap_err("job failed"))
        })
        .configuration(config)
        .build();

    let before = Utc::now();
    consumer.start().unwrap();

    let rolled_back = |n: usize| {
        let store = &store;
        let attempts = &attempts;
        move || async move {
            attempts.load(Ordering::SeqCst) == n
                && store.status(queue_id).await.as_deref() == Some("waiting")
        }
    };

    // First failure: back to waiting, one second out.
    assert!(eventually(WAIT, rolled_back(1)).await);
    let process_time = store.process_time(queue_id).await;
    assert!(process_time >= before.timestamp_millis() + 1000);
    assert!(process_time <= Utc::now().timestamp_millis() + 1000);

    // Second failure: back to waiting, three seconds out.
    let before = Utc::now();
    store.make_eligible(queue_id).await;
    assert!(eventually(WAIT, rolled_back(2)).await);
    let process_time = store.process_time(queue_id).await;
    assert!(process_time >= before.timestamp_millis() + 3000);
    assert!(process_time <= Utc::now().timestamp_millis() + 3000);

    // Schedule exhausted: the next failure is final.
    store.make_eligible(queue_id).await;
    assert!(eventually(WAIT, || async { store.count("MetaDataErrors").await == 1 }).await);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(store.count("MetaData").await, 0);
    assert_eq!(store.count("ErrorTracking").await, 0);

    let last_exception: String = sqlx::query_scalar(&format!(
        "SELECT LastException FROM {QUEUE}MetaDataErrors WHERE QueueID = $1"
    ))
    .bind(queue_id)
    .fetch_one(store.db().unwrap())
    .await
    .unwrap();
    assert!(last_exception.contains("job failed"));
    assert!(last_exception.contains("invalid operation"));

    consumer.dispose().await;
}

#[tokio::test]
async fn test_unregistered_error_is_not_retried() {
    let store = setup().await;
    send(&store, 1).await;

    let mut config = fast_config();
    config
        .transport_mut()
        .unwrap()
        .retry_mut()
        .unwrap()
        .register::<InvalidOperation>([Duration::from_secs(1)])
        .unwrap();

    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(|_: &ReceivedMessage<Job>, _: &WorkerNotification| -> eyre::Result<()> {
            Err(eyre::eyre!("something else"))
        })
        .configuration(config)
        .build();
    consumer.start().unwrap();

    assert!(eventually(WAIT, || async { store.count("MetaDataErrors").await == 1 }).await);
    assert_eq!(store.count("ErrorTracking").await, 0);

    consumer.dispose().await;
}

#[tokio::test]
async fn test_catch_all_schedule_applies_to_any_error() {
    let store = setup().await;
    let queue_id = send(&store, 1).await;

    let mut config = fast_config();
    config
        .transport_mut()
        .unwrap()
        .retry_mut()
        .unwrap()
        .register_any([Duration::from_secs(60)])
        .unwrap();

    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(|_: &ReceivedMessage<Job>, _: &WorkerNotification| -> eyre::Result<()> {
            Err(eyre::eyre!("transient"))
        })
        .configuration(config)
        .build();
    consumer.start().unwrap();

    assert!(eventually(WAIT, || async {
        store.count("ErrorTracking").await == 1
            && store.status(queue_id).await.as_deref() == Some("waiting")
    })
    .await);
    assert_eq!(store.count("MetaDataErrors").await, 0);

    consumer.dispose().await;
}

#[tokio::test]
async fn test_poison_message_moves_to_error() {
    let store = setup().await;
    ProducerQueue::<_, String>::new(store.store.clone())
        .send(
            &Message::new("not a job".to_owned()),
            &AdditionalMessageData::new(),
        )
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(move |_: &ReceivedMessage<Job>, _: &WorkerNotification| -> eyre::Result<()> {
            handler_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .configuration(fast_config())
        .build();
    consumer.start().unwrap();

    assert!(eventually(WAIT, || async { store.count("MetaDataErrors").await == 1 }).await);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let last_exception: String =
        sqlx::query_scalar(&format!("SELECT LastException FROM {QUEUE}MetaDataErrors"))
            .fetch_one(store.db().unwrap())
            .await
            .unwrap();
    assert!(last_exception.contains("poisoned"));

    consumer.dispose().await;
}

#[tokio::test]
async fn test_heartbeat_renews_lease_while_processing() {
    let store = setup().await;
    let queue_id = send(&store, 1).await;

    let handler = SlowHandler::new(Duration::from_millis(2500));
    let heartbeat_errors = handler.heartbeat_errors.clone();

    let mut config = fast_config();
    let heartbeat = config.transport_mut().unwrap().heartbeat_mut().unwrap();
    heartbeat.set_time(Duration::from_secs(5)).unwrap();
    heartbeat.set_update_time("sec(*%1)".to_owned()).unwrap();

    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(handler)
        .configuration(config)
        .build();
    consumer.start().unwrap();

    let heartbeat = || async {
        sqlx::query_scalar::<_, Option<i64>>(&format!(
            "SELECT HeartBeat FROM {QUEUE}MetaData WHERE QueueID = $1"
        ))
        .bind(queue_id)
        .fetch_optional(store.db().unwrap())
        .await
        .unwrap()
        .flatten()
    };

    assert!(eventually(WAIT, || async { heartbeat().await.is_some() }).await);
    let claimed = heartbeat().await.unwrap();
    assert!(eventually(WAIT, || async { consumer.active_leases() == 1 }).await);

    assert!(
        eventually(WAIT, || async {
            heartbeat().await.is_some_and(|renewed| renewed > claimed)
        })
        .await
    );

    assert!(eventually(WAIT, || async { store.count("MetaData").await == 0 }).await);
    assert_eq!(heartbeat_errors.load(Ordering::SeqCst), 0);
    assert!(eventually(WAIT, || async { consumer.active_leases() == 0 }).await);

    consumer.dispose().await;
}

#[tokio::test]
async fn test_lost_lease_is_reported_to_handler() {
    let store = setup().await;
    let queue_id = send(&store, 1).await;

    let handler = SlowHandler::new(Duration::from_secs(3));
    let heartbeat_errors = handler.heartbeat_errors.clone();
    let last_heartbeat_error = handler.last_heartbeat_error.clone();

    let mut config = fast_config();
    let heartbeat = config.transport_mut().unwrap().heartbeat_mut().unwrap();
    heartbeat.set_time(Duration::from_secs(5)).unwrap();
    heartbeat.set_update_time("sec(*%1)".to_owned()).unwrap();

    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(handler)
        .configuration(config)
        .build();
    consumer.start().unwrap();

    assert!(eventually(WAIT, || async {
        store.status(queue_id).await.as_deref() == Some("processing")
    })
    .await);

    // Another process judges the lease stale while the handler still runs.
    let reset = reset_stale_leases(&*store.store, Utc::now() + chrono::TimeDelta::hours(1))
        .await
        .unwrap();
    assert_eq!(reset, vec![queue_id]);

    assert!(eventually(WAIT, || async { heartbeat_errors.load(Ordering::SeqCst) > 0 }).await);
    assert!(last_heartbeat_error.lock().unwrap().is_some());

    consumer.dispose().await;
}

#[tokio::test]
async fn test_idle_workers_stop_cleanly() {
    let store = setup().await;

    let mut config = fast_config();
    let worker = config.worker_mut().unwrap();
    worker.set_worker_count(3).unwrap();
    worker
        .set_time_to_wait_for_workers_to_stop(Duration::from_secs(2))
        .unwrap();

    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(|_: &ReceivedMessage<Job>, _: &WorkerNotification| -> eyre::Result<()> { Ok(()) })
        .configuration(config)
        .build();
    consumer.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = consumer.shutdown().await.unwrap();
    assert_eq!(report.stopped, 3);
    assert!(report.is_clean());
    assert!(!consumer.is_running());
}

#[tokio::test]
async fn test_shutdown_cancels_busy_handler() {
    let store = setup().await;
    let queue_id = send(&store, 1).await;

    let mut config = fast_config();
    let worker = config.worker_mut().unwrap();
    worker
        .set_time_to_wait_for_workers_to_stop(Duration::from_millis(100))
        .unwrap();
    worker
        .set_time_to_wait_for_workers_to_cancel(Duration::from_secs(2))
        .unwrap();

    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(CooperativeHandler)
        .configuration(config)
        .build();
    consumer.start().unwrap();

    assert!(eventually(WAIT, || async {
        store.status(queue_id).await.as_deref() == Some("processing")
    })
    .await);

    let report = consumer.shutdown().await.unwrap();
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.aborted, 0);
    assert_eq!(report.abandoned, 0);
}

#[tokio::test]
async fn test_shutdown_aborts_stuck_handler() {
    let store = setup().await;
    let queue_id = send(&store, 1).await;

    let mut config = fast_config();
    let worker = config.worker_mut().unwrap();
    worker
        .set_time_to_wait_for_workers_to_stop(Duration::from_millis(50))
        .unwrap();
    worker
        .set_time_to_wait_for_workers_to_cancel(Duration::from_millis(50))
        .unwrap();
    worker.set_abort_worker_threads_when_stopping(true).unwrap();

    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(StuckHandler)
        .configuration(config)
        .build();
    consumer.start().unwrap();

    assert!(eventually(WAIT, || async {
        store.status(queue_id).await.as_deref() == Some("processing")
    })
    .await);

    let report = consumer.shutdown().await.unwrap();
    assert_eq!(report.aborted, 1);
    assert!(!report.is_clean());

    // Left claimed for lease recovery.
    assert_eq!(store.status(queue_id).await.as_deref(), Some("processing"));
}

#[tokio::test]
async fn test_lifecycle_errors() {
    let store = setup().await;

    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(|_: &ReceivedMessage<Job>, _: &WorkerNotification| -> eyre::Result<()> { Ok(()) })
        .configuration(fast_config())
        .build();

    assert!(matches!(
        consumer.shutdown().await,
        Err(Error::NotStarted { .. })
    ));

    consumer.start().unwrap();
    assert!(matches!(consumer.start(), Err(Error::AlreadyStarted { .. })));
    assert!(matches!(
        consumer.configuration_mut(),
        Err(Error::ReadOnly { .. })
    ));
    assert!(consumer.configuration().is_read_only());
    assert!(consumer.configuration().transport().retry().is_read_only());
    assert!(consumer.configuration().transport().queue_delay().is_read_only());

    // A locked section cannot be swapped for a fresh, unlocked one.
    let mut config = consumer.configuration().clone();
    assert!(matches!(
        config.transport_mut(),
        Err(Error::ReadOnly { .. })
    ));
    assert!(matches!(
        config.set_worker(WorkerConfiguration::default()),
        Err(Error::ReadOnly { .. })
    ));

    consumer.shutdown().await.unwrap();
    assert!(matches!(consumer.start(), Err(Error::AlreadyStarted { .. })));

    assert!(consumer.dispose().await.is_none());
    assert!(matches!(consumer.start(), Err(Error::Disposed { .. })));
    assert!(matches!(
        consumer.shutdown().await,
        Err(Error::Disposed { .. })
    ));
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected_on_start() {
    let store = setup().await;

    let mut config = fast_config();
    let heartbeat = config.transport_mut().unwrap().heartbeat_mut().unwrap();
    heartbeat.set_time(Duration::from_secs(1)).unwrap();
    heartbeat.set_update_time("sec(*%5)".to_owned()).unwrap();

    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(|_: &ReceivedMessage<Job>, _: &WorkerNotification| -> eyre::Result<()> { Ok(()) })
        .configuration(config)
        .build();

    assert!(matches!(
        consumer.start(),
        Err(Error::InvalidArgument { .. })
    ));
    assert!(!consumer.is_running());
}

#[tokio::test]
async fn test_status_monitor_publishes_counts() {
    let store = setup().await;
    send(&store, 1).await;
    send(&store, 2).await;

    let mut config = fast_config();
    let worker = config.worker_mut().unwrap();
    worker.set_worker_count(1).unwrap();
    worker
        .set_time_to_wait_for_workers_to_stop(Duration::from_millis(100))
        .unwrap();
    let status = config.status_mut().unwrap();
    status.set_enabled(true).unwrap();
    status.set_monitor_time(Duration::from_millis(50)).unwrap();

    // Holds the first message so the counts are stable.
    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(CooperativeHandler)
        .configuration(config)
        .build();
    consumer.start().unwrap();

    assert!(eventually(WAIT, || async {
        consumer
            .status()
            .is_some_and(|(_, status)| status.processing == 1 && status.waiting == 1)
    })
    .await);

    consumer.dispose().await;
}

#[tokio::test]
async fn test_consumer_on_unprovisioned_store_idles() {
    let store = Arc::new(
        SqliteStore::connect("", QUEUE, relayq::QueueOptions::default())
            .await
            .unwrap(),
    );

    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store)
        .handler(|_: &ReceivedMessage<Job>, _: &WorkerNotification| -> eyre::Result<()> { Ok(()) })
        .configuration(fast_config())
        .build();
    consumer.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = consumer.shutdown().await.unwrap();
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_panicking_handler_is_quarantined_and_worker_continues() {
    let store = setup().await;
    let poisoned = send(&store, 1).await;
    let healthy = send(&store, 2).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler_seen = seen.clone();
    let mut config = fast_config();
    config.worker_mut().unwrap().set_worker_count(1).unwrap();

    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(move |message: &ReceivedMessage<Job>, _: &WorkerNotification| -> eyre::Result<()> {
            handler_seen.lock().unwrap().push(message.body.n);
            if message.body.n == 1 {
                panic!("bad job");
            }
            Ok(())
        })
        .configuration(config)
        .build();
    consumer.start().unwrap();

    assert!(eventually(WAIT, || async {
        store.count("MetaDataErrors").await == 1 && store.count("MetaData").await == 0
    })
    .await);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    assert_eq!(consumer.running_workers(), 1);
    assert_eq!(store.status(healthy).await, None);

    let last_exception: String = sqlx::query_scalar(&format!(
        "SELECT LastException FROM {QUEUE}MetaDataErrors WHERE QueueID = $1"
    ))
    .bind(poisoned)
    .fetch_one(store.db().unwrap())
    .await
    .unwrap();
    assert!(last_exception.contains("panicked"));
    assert!(last_exception.contains("bad job"));

    let report = consumer.shutdown().await.unwrap();
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_failed_settlement_leaves_message_for_lease_recovery() {
    let store = setup().await;
    let queue_id = send(&store, 1).await;

    // Breaks the retry bookkeeping, so settling the handler's failure fails too.
    sqlx::query(&format!("DROP TABLE {QUEUE}ErrorTracking"))
        .execute(store.db().unwrap())
        .await
        .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let handler_attempts = attempts.clone();
    let mut config = fast_config();
    config
        .transport_mut()
        .unwrap()
        .retry_mut()
        .unwrap()
        .register::<InvalidOperation>([Duration::from_millis(10)])
        .unwrap();

    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(move |_: &ReceivedMessage<Job>, _: &WorkerNotification| -> eyre::Result<()> {
            handler_attempts.fetch_add(1, Ordering::SeqCst);
            Err(eyre::Report::new(InvalidOperation))
        })
        .configuration(config)
        .build();
    consumer.start().unwrap();

    assert!(eventually(WAIT, || async { attempts.load(Ordering::SeqCst) == 1 }).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The worker backed off and kept running; the message is still claimed.
    assert_eq!(consumer.running_workers(), 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(store.status(queue_id).await.as_deref(), Some("processing"));
    assert_eq!(store.count("MetaDataErrors").await, 0);

    let report = consumer.shutdown().await.unwrap();
    assert!(report.is_clean());

    let reset = reset_stale_leases(&*store.store, Utc::now() + chrono::TimeDelta::hours(1))
        .await
        .unwrap();
    assert_eq!(reset, vec![queue_id]);
    assert_eq!(store.status(queue_id).await.as_deref(), Some("waiting"));
}

#[tokio::test]
async fn test_lost_lease_does_not_use_up_a_retry() {
    let store = setup().await;
    let queue_id = send(&store, 1).await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let mut config = fast_config();
    let transport = config.transport_mut().unwrap();
    transport
        .retry_mut()
        .unwrap()
        .register::<InvalidOperation>([Duration::from_secs(1)])
        .unwrap();
    transport.heartbeat_mut().unwrap().set_enabled(false).unwrap();

    let mut consumer = ConsumerQueue::<_, Job, _>::builder()
        .store(store.store.clone())
        .handler(LeaseLosingHandler {
            store: store.store.clone(),
            attempts: attempts.clone(),
        })
        .configuration(config)
        .build();
    consumer.start().unwrap();

    assert!(eventually(WAIT, || async { attempts.load(Ordering::SeqCst) == 1 }).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The rollback lost its lease check, so nothing was released or counted.
    assert_eq!(store.status(queue_id).await.as_deref(), Some("processing"));
    assert_eq!(store.count("ErrorTracking").await, 0);

    consumer.dispose().await;
}
