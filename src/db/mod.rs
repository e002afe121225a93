//! SQLite backed [`MessageStore`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};
use tokio::sync::OnceCell;

use crate::{
    error::Error,
    message::{ClaimedMessage, JobMetadata, OutboundMessage, QueueId, SentMessage},
    store::{ExpiredLease, MessageStore, QueueStatus},
};

pub mod message;
pub mod queue;

use message::QueuedMessage;
pub use queue::{Queue, QueueOptions, TableNames};

/// Columns of the error table that are filled from the meta row.
const ERROR_ONLY_COLUMNS: [&str; 3] = ["ErrorID", "LastException", "LastExceptionDate"];

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct SqliteStore {
    db: Option<SqlitePool>,
    tables: TableNames,
    options: QueueOptions,
    error_columns: std::sync::Arc<OnceCell<Vec<String>>>,
}

impl SqliteStore {
    /// Opens a pool on `connection_string` (a file path). An empty string gives an
    /// unprovisioned store whose operations are no-ops, apart from `send`, which
    /// fails.
    pub async fn connect(
        connection_string: impl AsRef<str>,
        queue: impl AsRef<str>,
        options: QueueOptions,
    ) -> Result<Self, Error> {
        let tables = TableNames::new(queue)?;
        let path = connection_string.as_ref();

        let db = if path.trim().is_empty() {
            tracing::warn!(queue = %tables.queue, "no connection string, store is unprovisioned");
            None
        } else {
            let opts = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .foreign_keys(true)
                .journal_mode(SqliteJournalMode::Wal)
                .locking_mode(SqliteLockingMode::Normal)
                .busy_timeout(BUSY_TIMEOUT)
                .optimize_on_close(true, None)
                .auto_vacuum(SqliteAutoVacuum::Full);

            Some(SqlitePoolOptions::new().connect_with(opts).await?)
        };

        Ok(Self {
            db,
            tables,
            options,
            error_columns: Default::default(),
        })
    }

    /// Connects and adopts the options the queue was created with.
    pub async fn open(
        connection_string: impl AsRef<str>,
        queue: impl AsRef<str>,
    ) -> Result<Self, Error> {
        let mut store = Self::connect(connection_string, queue, QueueOptions::default()).await?;
        if let Some(db) = &store.db {
            let mut conn = db.acquire().await?;
            store.options = Queue::load_options(&mut conn, &store.tables).await?;
        }
        Ok(store)
    }

    pub fn db(&self) -> Option<&SqlitePool> {
        self.db.as_ref()
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub async fn create_queue(&self) -> Result<(), Error> {
        let Some(db) = &self.db else {
            return Err(Error::invalid_argument(
                "cannot create a queue without a connection string",
            ));
        };
        let mut conn = db.acquire().await?;
        Queue::create(&mut conn, &self.tables, &self.options).await
    }

    pub async fn remove_queue(&self) -> Result<(), Error> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let mut conn = db.acquire().await?;
        Queue::delete(&mut conn, &self.tables).await
    }

    pub async fn queue_exists(&self) -> Result<bool, Error> {
        let Some(db) = &self.db else {
            return Ok(false);
        };
        let mut conn = db.acquire().await?;
        Queue::exists(&mut conn, &self.tables).await
    }

    /// Meta columns copied into the error table, resolved once per store.
    async fn error_columns(&self, db: &SqlitePool) -> Result<&[String], Error> {
        let columns = self
            .error_columns
            .get_or_try_init(|| async {
                let mut conn = db.acquire().await?;
                let meta = Queue::columns(&mut conn, &self.tables.meta).await?;
                let errors = Queue::columns(&mut conn, &self.tables.meta_errors).await?;

                Ok::<_, Error>(
                    meta.into_iter()
                        .filter(|c| errors.contains(c) && !ERROR_ONLY_COLUMNS.contains(&c.as_str()))
                        .collect(),
                )
            })
            .await?;
        Ok(columns.as_slice())
    }
}

impl MessageStore for SqliteStore {
    fn is_provisioned(&self) -> bool {
        self.db.is_some()
    }

    async fn send(
        &self,
        message: OutboundMessage,
        job: Option<JobMetadata>,
    ) -> Result<SentMessage, Error> {
        let Some(db) = &self.db else {
            return Err(Error::invalid_argument(
                "cannot send without a connection string",
            ));
        };

        let mut tx = db.begin().await?;

        if let Some(job) = &job {
            if !QueuedMessage::upsert_job(&mut tx, &self.tables, job).await? {
                return Err(Error::JobAlreadyQueued {
                    job_name: job.job_name.clone(),
                    scheduled_time: job.scheduled_time,
                });
            }
        }

        let queue_id = QueuedMessage::insert(
            &mut tx,
            &self.tables,
            &self.options,
            &message,
            job.as_ref().map(|j| j.job_name.as_str()),
            Utc::now(),
        )
        .await?;

        tx.commit().await?;

        tracing::debug!(queue = %self.tables.queue, %queue_id, "sent message");

        Ok(SentMessage {
            queue_id,
            correlation_id: message.correlation_id,
        })
    }

    async fn ping(&self) -> Result<(), Error> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        sqlx::query("SELECT 1").execute(db).await?;
        Ok(())
    }

    async fn receive(&self, now: DateTime<Utc>) -> Result<Option<ClaimedMessage>, Error> {
        let Some(db) = &self.db else {
            return Ok(None);
        };

        let mut tx = db.begin().await?;
        let claimed = QueuedMessage::claim(&mut tx, &self.tables, &self.options, now).await?;
        tx.commit().await?;

        if let Some(claimed) = &claimed {
            tracing::trace!(queue = %self.tables.queue, queue_id = %claimed.queue_id, "claimed message");
        }
        Ok(claimed)
    }

    async fn commit(&self, queue_id: QueueId) -> Result<u64, Error> {
        let Some(db) = &self.db else {
            return Ok(0);
        };

        let mut tx = db.begin().await?;
        let removed =
            QueuedMessage::delete(&mut tx, &self.tables, &self.options, queue_id, None).await?;
        tx.commit().await?;

        Ok(removed)
    }

    async fn rollback(
        &self,
        queue_id: QueueId,
        last_known_lease: Option<DateTime<Utc>>,
        increase_delay_by: Option<Duration>,
    ) -> Result<bool, Error> {
        let Some(db) = &self.db else {
            return Ok(false);
        };

        let process_at = increase_delay_by
            .filter(|d| self.options.enable_delay && !d.is_zero())
            .map(|d| Utc::now() + d);

        let mut tx = db.begin().await?;
        let released = QueuedMessage::release(
            &mut tx,
            &self.tables,
            &self.options,
            queue_id,
            last_known_lease,
            process_at,
        )
        .await?;
        tx.commit().await?;

        Ok(released)
    }

    async fn move_to_error(&self, queue_id: QueueId, error: &str) -> Result<bool, Error> {
        let Some(db) = &self.db else {
            return Ok(false);
        };
        let columns = self.error_columns(db).await?;

        let mut tx = db.begin().await?;
        let moved = QueuedMessage::move_to_error(
            &mut tx,
            &self.tables,
            &self.options,
            columns,
            queue_id,
            error,
            Utc::now(),
        )
        .await?;
        tx.commit().await?;

        Ok(moved)
    }

    async fn try_renew_lease(
        &self,
        queue_id: QueueId,
        expected: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        let Some(db) = &self.db else {
            return Ok(None);
        };
        let mut conn = db.acquire().await?;
        let renewed =
            QueuedMessage::renew_lease(&mut conn, &self.tables, queue_id, expected, now).await?;
        Ok(renewed.then_some(now))
    }

    async fn find_expired_leases(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ExpiredLease>, Error> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };
        let mut conn = db.acquire().await?;
        QueuedMessage::expired_leases(&mut conn, &self.tables, older_than).await
    }

    async fn reset_lease(&self, lease: ExpiredLease) -> Result<bool, Error> {
        let Some(db) = &self.db else {
            return Ok(false);
        };

        let mut tx = db.begin().await?;
        let reset = QueuedMessage::release(
            &mut tx,
            &self.tables,
            &self.options,
            lease.queue_id,
            Some(lease.heartbeat),
            None,
        )
        .await?;
        tx.commit().await?;

        Ok(reset)
    }

    async fn find_expired_messages(&self, now: DateTime<Utc>) -> Result<Vec<QueueId>, Error> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };
        let mut conn = db.acquire().await?;
        QueuedMessage::expired_messages(&mut conn, &self.tables, now).await
    }

    async fn delete_waiting_message(&self, queue_id: QueueId) -> Result<bool, Error> {
        let Some(db) = &self.db else {
            return Ok(false);
        };

        let mut tx = db.begin().await?;
        let removed = QueuedMessage::delete(
            &mut tx,
            &self.tables,
            &self.options,
            queue_id,
            Some(crate::message::MessageStatus::Waiting),
        )
        .await?;
        tx.commit().await?;

        Ok(removed > 0)
    }

    async fn find_old_errors(&self, older_than: DateTime<Utc>) -> Result<Vec<QueueId>, Error> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };
        let mut conn = db.acquire().await?;
        QueuedMessage::old_errors(&mut conn, &self.tables, older_than).await
    }

    async fn delete_error_message(&self, queue_id: QueueId) -> Result<bool, Error> {
        let Some(db) = &self.db else {
            return Ok(false);
        };

        let mut tx = db.begin().await?;
        let removed =
            QueuedMessage::delete_error(&mut tx, &self.tables, &self.options, queue_id).await?;
        tx.commit().await?;

        Ok(removed)
    }

    async fn error_retry_count(&self, queue_id: QueueId, exception_type: &str) -> Result<u32, Error> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let mut conn = db.acquire().await?;
        QueuedMessage::retry_count(&mut conn, &self.tables, queue_id, exception_type).await
    }

    async fn increment_error_count(
        &self,
        queue_id: QueueId,
        exception_type: &str,
    ) -> Result<(), Error> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let mut conn = db.acquire().await?;
        QueuedMessage::increment_retry_count(&mut conn, &self.tables, queue_id, exception_type)
            .await
    }

    async fn queue_status(&self) -> Result<QueueStatus, Error> {
        let Some(db) = &self.db else {
            return Ok(QueueStatus::default());
        };
        let mut conn = db.acquire().await?;
        let (waiting, processing, error) = QueuedMessage::counts(&mut conn, &self.tables).await?;

        Ok(QueueStatus {
            waiting: waiting.max(0) as u64,
            processing: processing.max(0) as u64,
            error: error.max(0) as u64,
        })
    }

    async fn last_job_event_time(&self, job_name: &str) -> Result<Option<DateTime<Utc>>, Error> {
        let Some(db) = &self.db else {
            return Ok(None);
        };
        let mut conn = db.acquire().await?;
        QueuedMessage::job_event_time(&mut conn, &self.tables, job_name).await
    }
}
