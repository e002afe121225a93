//! Per-queue table layout and queue creation.
//!
//! Every queue owns its own set of tables, named after the queue:
//!
//! | table                  | contents                                        |
//! |------------------------|-------------------------------------------------|
//! | `{q}`                  | body, headers and codec                         |
//! | `{q}MetaData`          | status, lease, process/expiration times         |
//! | `{q}Status`            | optional mirror of the status for reporting     |
//! | `{q}ErrorTracking`     | retry counter per (message, error type)         |
//! | `{q}MetaDataErrors`    | messages whose retries ran out                  |
//! | `{q}JobTable`          | last scheduled/event time per job name          |
//! | `{q}Configuration`     | the [`QueueOptions`] the queue was created with |

use serde::{Deserialize, Serialize};
use sqlx::{Connection, SqliteConnection};

use crate::error::Error;

/// Options persisted with the queue when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub enable_status_table: bool,
    pub enable_heartbeat: bool,
    pub enable_delay: bool,
    pub enable_message_expiration: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            enable_status_table: false,
            enable_heartbeat: true,
            enable_delay: true,
            enable_message_expiration: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub queue: String,
    pub body: String,
    pub meta: String,
    pub status: String,
    pub error_tracking: String,
    pub meta_errors: String,
    pub job: String,
    pub configuration: String,
}

impl TableNames {
    /// Queue names end up inside SQL text, so only `[A-Za-z0-9_]` is accepted.
    pub fn new(queue: impl AsRef<str>) -> Result<Self, Error> {
        let queue = queue.as_ref();
        if queue.is_empty()
            || !queue
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::invalid_argument(format!(
                "queue name {queue:?} must be non-empty and contain only letters, digits and '_'"
            )));
        }

        Ok(Self {
            queue: queue.to_owned(),
            body: queue.to_owned(),
            meta: format!("{queue}MetaData"),
            status: format!("{queue}Status"),
            error_tracking: format!("{queue}ErrorTracking"),
            meta_errors: format!("{queue}MetaDataErrors"),
            job: format!("{queue}JobTable"),
            configuration: format!("{queue}Configuration"),
        })
    }

    fn all(&self) -> [&str; 7] {
        [
            &self.body,
            &self.meta,
            &self.status,
            &self.error_tracking,
            &self.meta_errors,
            &self.job,
            &self.configuration,
        ]
    }
}

pub struct Queue;

impl Queue {
    pub fn creation_script(tables: &TableNames, options: &QueueOptions) -> Vec<String> {
        let TableNames {
            body,
            meta,
            status,
            error_tracking,
            meta_errors,
            job,
            configuration,
            ..
        } = tables;

        let mut script = vec![
            format!(
                "
                CREATE TABLE {body} (
                    QueueID INTEGER PRIMARY KEY AUTOINCREMENT,
                    Body BLOB NOT NULL,
                    Headers BLOB NOT NULL,
                    Codec TEXT NOT NULL
                )
                "
            ),
            format!(
                "
                CREATE TABLE {meta} (
                    QueueID INTEGER PRIMARY KEY,
                    CorrelationID TEXT NOT NULL,
                    QueuedDateTime INTEGER NOT NULL,
                    Status TEXT NOT NULL DEFAULT 'waiting',
                    HeartBeat INTEGER NULL,
                    QueueProcessTime INTEGER NOT NULL,
                    ExpirationTime INTEGER NULL,
                    JobName TEXT NULL
                )
                "
            ),
            format!("CREATE INDEX IX_{meta}_Dequeue ON {meta} (Status, QueueProcessTime, QueueID)"),
            format!("CREATE INDEX IX_{meta}_HeartBeat ON {meta} (Status, HeartBeat)"),
            format!(
                "
                CREATE TABLE {error_tracking} (
                    ErrorTrackingID INTEGER PRIMARY KEY AUTOINCREMENT,
                    QueueID INTEGER NOT NULL,
                    ExceptionType TEXT NOT NULL,
                    RetryCount INTEGER NOT NULL,
                    UNIQUE (QueueID, ExceptionType)
                )
                "
            ),
            format!(
                "
                CREATE TABLE {meta_errors} (
                    ErrorID INTEGER PRIMARY KEY AUTOINCREMENT,
                    QueueID INTEGER NOT NULL,
                    CorrelationID TEXT NOT NULL,
                    QueuedDateTime INTEGER NOT NULL,
                    Status TEXT NOT NULL,
                    HeartBeat INTEGER NULL,
                    QueueProcessTime INTEGER NOT NULL,
                    ExpirationTime INTEGER NULL,
                    JobName TEXT NULL,
                    LastException TEXT NOT NULL,
                    LastExceptionDate INTEGER NOT NULL
                )
                "
            ),
            format!("CREATE INDEX IX_{meta_errors}_Date ON {meta_errors} (LastExceptionDate)"),
            format!(
                "
                CREATE TABLE {job} (
                    JobName TEXT PRIMARY KEY NOT NULL,
                    JobEventTime INTEGER NOT NULL,
                    JobScheduledTime INTEGER NOT NULL
                )
                "
            ),
            format!(
                "
                CREATE TABLE {configuration} (
                    ID INTEGER PRIMARY KEY CHECK (ID = 1),
                    Configuration TEXT NOT NULL
                )
                "
            ),
        ];

        if options.enable_status_table {
            script.push(format!(
                "
                CREATE TABLE {status} (
                    QueueID INTEGER PRIMARY KEY,
                    Status TEXT NOT NULL,
                    CorrelationID TEXT NOT NULL
                )
                "
            ));
        }

        script
    }

    pub async fn exists(db: &mut SqliteConnection, tables: &TableNames) -> Result<bool, Error> {
        let exists = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = $1)",
        )
        .bind(&tables.meta)
        .fetch_one(db)
        .await?;
        Ok(exists)
    }

    /// Creates every table in one transaction. A failing statement is reported
    /// together with its SQL text.
    pub async fn create(
        db: &mut SqliteConnection,
        tables: &TableNames,
        options: &QueueOptions,
    ) -> Result<(), Error> {
        if Self::exists(&mut *db, tables).await? {
            return Err(Error::QueueExists {
                name: tables.queue.clone(),
            });
        }

        let mut tx = db.begin().await?;

        for statement in Self::creation_script(tables, options) {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|source| Error::Creation {
                    script: statement.trim().to_owned(),
                    source,
                })?;
        }

        let insert = format!(
            "INSERT INTO {} (ID, Configuration) VALUES (1, $1)",
            tables.configuration
        );
        sqlx::query(&insert)
            .bind(serde_json::to_string(options)?)
            .execute(&mut *tx)
            .await
            .map_err(|source| Error::Creation {
                script: insert.clone(),
                source,
            })?;

        tx.commit().await?;

        tracing::info!(queue = %tables.queue, "created queue");
        Ok(())
    }

    pub async fn load_options(
        db: &mut SqliteConnection,
        tables: &TableNames,
    ) -> Result<QueueOptions, Error> {
        let raw: String = sqlx::query_scalar(&format!(
            "SELECT Configuration FROM {} WHERE ID = 1",
            tables.configuration
        ))
        .fetch_one(db)
        .await?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn delete(db: &mut SqliteConnection, tables: &TableNames) -> Result<(), Error> {
        let mut tx = db.begin().await?;

        for table in tables.all() {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::info!(queue = %tables.queue, "removed queue");
        Ok(())
    }

    /// Column names of `table` in declaration order.
    pub async fn columns(db: &mut SqliteConnection, table: &str) -> Result<Vec<String>, Error> {
        Ok(
            sqlx::query_scalar("SELECT name FROM pragma_table_info($1) ORDER BY cid")
                .bind(table)
                .fetch_all(db)
                .await?,
        )
    }
}
