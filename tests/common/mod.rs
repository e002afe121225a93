#![allow(dead_code)]

use std::{future::Future, ops::Deref, sync::Arc, time::Duration};

use relayq::{QueueId, QueueOptions, SqliteStore};
use tempfile::TempDir;

pub const QUEUE: &str = "test";

pub struct TmpStore {
    pub store: Arc<SqliteStore>,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpStore {
    type Target = SqliteStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

impl TmpStore {
    pub fn path(&self) -> String {
        self.tmpdir
            .path()
            .join("relayq.db")
            .to_string_lossy()
            .to_string()
    }

    /// Row count of `{queue}{suffix}`.
    pub async fn count(&self, suffix: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {QUEUE}{suffix}"))
            .fetch_one(self.db().unwrap())
            .await
            .unwrap()
    }

    pub async fn process_time(&self, queue_id: QueueId) -> i64 {
        sqlx::query_scalar(&format!(
            "SELECT QueueProcessTime FROM {QUEUE}MetaData WHERE QueueID = $1"
        ))
        .bind(queue_id)
        .fetch_one(self.db().unwrap())
        .await
        .unwrap()
    }

    pub async fn status(&self, queue_id: QueueId) -> Option<String> {
        sqlx::query_scalar(&format!(
            "SELECT Status FROM {QUEUE}MetaData WHERE QueueID = $1"
        ))
        .bind(queue_id)
        .fetch_optional(self.db().unwrap())
        .await
        .unwrap()
    }

    /// Makes a delayed message eligible right away.
    pub async fn make_eligible(&self, queue_id: QueueId) {
        sqlx::query(&format!(
            "UPDATE {QUEUE}MetaData SET QueueProcessTime = 0 WHERE QueueID = $1"
        ))
        .bind(queue_id)
        .execute(self.db().unwrap())
        .await
        .unwrap();
    }
}

pub async fn setup() -> TmpStore {
    setup_with(QueueOptions::default()).await
}

pub async fn setup_with(options: QueueOptions) -> TmpStore {
    let tmpdir = tempfile::tempdir().unwrap();
    let path = tmpdir.path().join("relayq.db");

    let store = SqliteStore::connect(path.to_string_lossy(), QUEUE, options)
        .await
        .unwrap();
    store.create_queue().await.unwrap();

    TmpStore {
        store: Arc::new(store),
        tmpdir,
    }
}

/// Polls `check` until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
