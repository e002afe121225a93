//! Row level commands against a queue's tables.
//!
//! Every function takes the connection it runs on, so callers decide the
//! transaction boundary. Functions that are used as the first statement of a write
//! transaction are writes themselves, which makes SQLite take the write lock up
//! front instead of upgrading a read snapshot later.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use sqlx::{prelude::FromRow, SqliteConnection};
use tokio_stream::StreamExt;

use super::queue::{QueueOptions, TableNames};
use crate::{
    error::Error,
    message::{
        from_millis, to_millis, ClaimedMessage, Headers, JobMetadata, MessageCodec,
        MessageStatus, OutboundMessage, QueueId,
    },
    store::ExpiredLease,
};

#[derive(FromRow)]
struct ClaimedRow {
    #[sqlx(rename = "QueueID")]
    queue_id: QueueId,
    #[sqlx(rename = "CorrelationID")]
    correlation_id: String,
    #[sqlx(rename = "QueuedDateTime")]
    queued_at: i64,
}

#[derive(FromRow)]
struct BodyRow {
    #[sqlx(rename = "Body")]
    body: Vec<u8>,
    #[sqlx(rename = "Headers")]
    headers: Vec<u8>,
    #[sqlx(rename = "Codec")]
    codec: String,
}

#[derive(FromRow)]
struct LeaseRow {
    #[sqlx(rename = "QueueID")]
    queue_id: QueueId,
    #[sqlx(rename = "HeartBeat")]
    heartbeat: i64,
}

pub struct QueuedMessage;

impl QueuedMessage {
    /// Records the job's schedule. Returns false when the same (name, scheduled
    /// time) pair is already recorded.
    pub async fn upsert_job(
        db: &mut SqliteConnection,
        tables: &TableNames,
        job: &JobMetadata,
    ) -> Result<bool, Error> {
        let result = sqlx::query(&format!(
            "
            INSERT INTO {job} (JobName, JobEventTime, JobScheduledTime) VALUES ($1, $2, $3)
            ON CONFLICT (JobName) DO UPDATE
                SET JobEventTime = excluded.JobEventTime,
                    JobScheduledTime = excluded.JobScheduledTime
                WHERE JobScheduledTime <> excluded.JobScheduledTime
            ",
            job = tables.job
        ))
        .bind(&job.job_name)
        .bind(to_millis(job.event_time))
        .bind(to_millis(job.scheduled_time))
        .execute(db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn insert(
        db: &mut SqliteConnection,
        tables: &TableNames,
        options: &QueueOptions,
        message: &OutboundMessage,
        job_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<QueueId, Error> {
        let queue_id: QueueId = sqlx::query_scalar(&format!(
            "INSERT INTO {} (Body, Headers, Codec) VALUES ($1, $2, $3) RETURNING QueueID",
            tables.body
        ))
        .bind(&message.body)
        .bind(serde_json::to_vec(&message.headers)?)
        .bind(message.codec.to_string())
        .fetch_one(&mut *db)
        .await?;

        let process_time = match message.delay {
            Some(delay) if options.enable_delay => now + delay,
            _ => now,
        };
        let expiration = match message.expiration {
            Some(expiration) if options.enable_message_expiration => Some(now + expiration),
            _ => None,
        };

        sqlx::query(&format!(
            "
            INSERT INTO {} (QueueID, CorrelationID, QueuedDateTime, Status, QueueProcessTime, ExpirationTime, JobName)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
            tables.meta
        ))
        .bind(queue_id)
        .bind(&message.correlation_id)
        .bind(to_millis(now))
        .bind(MessageStatus::Waiting)
        .bind(to_millis(process_time))
        .bind(expiration.map(to_millis))
        .bind(job_name)
        .execute(&mut *db)
        .await?;

        if options.enable_status_table {
            sqlx::query(&format!(
                "INSERT INTO {} (QueueID, Status, CorrelationID) VALUES ($1, $2, $3)",
                tables.status
            ))
            .bind(queue_id)
            .bind(MessageStatus::Waiting)
            .bind(&message.correlation_id)
            .execute(&mut *db)
            .await?;
        }

        Ok(queue_id)
    }

    /// Claims the oldest eligible row in one statement. The inner select and the
    /// status check in the outer `WHERE` make a concurrent claim of the same row
    /// update nothing.
    pub async fn claim(
        db: &mut SqliteConnection,
        tables: &TableNames,
        options: &QueueOptions,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedMessage>, Error> {
        let expiration_filter = if options.enable_message_expiration {
            "AND (ExpirationTime IS NULL OR ExpirationTime > $1)"
        } else {
            ""
        };

        let claimed: Option<ClaimedRow> = sqlx::query_as(&format!(
            "
            UPDATE {meta} SET Status = 'processing', HeartBeat = $1
            WHERE QueueID = (
                SELECT QueueID FROM {meta}
                WHERE Status = 'waiting' AND QueueProcessTime <= $1 {expiration_filter}
                ORDER BY QueueProcessTime, QueueID
                LIMIT 1
            )
            AND Status = 'waiting'
            RETURNING QueueID, CorrelationID, QueuedDateTime
            ",
            meta = tables.meta
        ))
        .bind(to_millis(now))
        .fetch_optional(&mut *db)
        .await?;

        let Some(claimed) = claimed else {
            return Ok(None);
        };

        Self::set_status(&mut *db, tables, options, claimed.queue_id, MessageStatus::Processing)
            .await?;

        let body: BodyRow = sqlx::query_as(&format!(
            "SELECT Body, Headers, Codec FROM {} WHERE QueueID = $1",
            tables.body
        ))
        .bind(claimed.queue_id)
        .fetch_one(&mut *db)
        .await?;

        // An unreadable codec or header blob still hands the message to the worker,
        // which fails to decode it and parks it in the error table.
        let codec = body.codec.parse().unwrap_or_else(|_| {
            tracing::warn!(queue_id = %claimed.queue_id, codec = %body.codec, "unknown codec");
            MessageCodec::default()
        });
        let headers: Headers = serde_json::from_slice(&body.headers).unwrap_or_else(|e| {
            tracing::warn!(queue_id = %claimed.queue_id, error = %e, "unreadable headers");
            Headers::default()
        });

        Ok(Some(ClaimedMessage {
            queue_id: claimed.queue_id,
            correlation_id: claimed.correlation_id,
            body: body.body,
            codec,
            headers,
            queued_at: from_millis(claimed.queued_at),
            lease: now,
        }))
    }

    async fn set_status(
        db: &mut SqliteConnection,
        tables: &TableNames,
        options: &QueueOptions,
        queue_id: QueueId,
        status: MessageStatus,
    ) -> Result<(), Error> {
        if !options.enable_status_table {
            return Ok(());
        }
        sqlx::query(&format!(
            "UPDATE {} SET Status = $1 WHERE QueueID = $2",
            tables.status
        ))
        .bind(status)
        .bind(queue_id)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Deletes every trace of the message except the error table. Returns the
    /// number of meta rows removed.
    pub async fn delete(
        db: &mut SqliteConnection,
        tables: &TableNames,
        options: &QueueOptions,
        queue_id: QueueId,
        only_when: Option<MessageStatus>,
    ) -> Result<u64, Error> {
        let query = format!(
            "DELETE FROM {} WHERE QueueID = $1 AND ($2 IS NULL OR Status = $2)",
            tables.meta
        );
        let removed = sqlx::query(&query)
            .bind(queue_id)
            .bind(only_when)
            .execute(&mut *db)
            .await?
            .rows_affected();

        if removed == 0 && only_when.is_some() {
            return Ok(0);
        }

        Self::delete_body(&mut *db, tables, options, queue_id).await?;
        Self::delete_tracking(&mut *db, tables, queue_id).await?;

        Ok(removed)
    }

    async fn delete_body(
        db: &mut SqliteConnection,
        tables: &TableNames,
        options: &QueueOptions,
        queue_id: QueueId,
    ) -> Result<(), Error> {
        sqlx::query(&format!("DELETE FROM {} WHERE QueueID = $1", tables.body))
            .bind(queue_id)
            .execute(&mut *db)
            .await?;

        if options.enable_status_table {
            sqlx::query(&format!("DELETE FROM {} WHERE QueueID = $1", tables.status))
                .bind(queue_id)
                .execute(&mut *db)
                .await?;
        }
        Ok(())
    }

    async fn delete_tracking(
        db: &mut SqliteConnection,
        tables: &TableNames,
        queue_id: QueueId,
    ) -> Result<(), Error> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE QueueID = $1",
            tables.error_tracking
        ))
        .bind(queue_id)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Returns a claimed message to `Waiting`.
    pub async fn release(
        db: &mut SqliteConnection,
        tables: &TableNames,
        options: &QueueOptions,
        queue_id: QueueId,
        last_known_lease: Option<DateTime<Utc>>,
        process_at: Option<DateTime<Utc>>,
    ) -> Result<bool, Error> {
        let released = sqlx::query(&format!(
            "
            UPDATE {meta}
            SET Status = 'waiting', HeartBeat = NULL, QueueProcessTime = COALESCE($2, QueueProcessTime)
            WHERE QueueID = $1 AND Status = 'processing' AND ($3 IS NULL OR HeartBeat = $3)
            ",
            meta = tables.meta
        ))
        .bind(queue_id)
        .bind(process_at.map(to_millis))
        .bind(last_known_lease.map(to_millis))
        .execute(&mut *db)
        .await?
        .rows_affected()
            == 1;

        if released {
            Self::set_status(db, tables, options, queue_id, MessageStatus::Waiting).await?;
        }
        Ok(released)
    }

    /// Copies the meta row into the error table and removes it from the queue.
    /// `columns` are the meta columns the error table also has.
    pub async fn move_to_error(
        db: &mut SqliteConnection,
        tables: &TableNames,
        options: &QueueOptions,
        columns: &[String],
        queue_id: QueueId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let insert_list = columns.join(", ");
        let select_list = columns
            .iter()
            .map(|c| if c == "Status" { "'error'" } else { c.as_str() })
            .join(", ");

        let copied = sqlx::query(&format!(
            "
            INSERT INTO {errors} ({insert_list}, LastException, LastExceptionDate)
            SELECT {select_list}, $1, $2 FROM {meta}
            WHERE QueueID = $3 AND Status = 'processing'
            ",
            errors = tables.meta_errors,
            meta = tables.meta
        ))
        .bind(error)
        .bind(to_millis(now))
        .bind(queue_id)
        .execute(&mut *db)
        .await?
        .rows_affected();

        if copied == 0 {
            return Ok(false);
        }

        sqlx::query(&format!("DELETE FROM {} WHERE QueueID = $1", tables.meta))
            .bind(queue_id)
            .execute(&mut *db)
            .await?;
        Self::set_status(&mut *db, tables, options, queue_id, MessageStatus::Error).await?;
        Self::delete_tracking(&mut *db, tables, queue_id).await?;

        Ok(true)
    }

    pub async fn delete_error(
        db: &mut SqliteConnection,
        tables: &TableNames,
        options: &QueueOptions,
        queue_id: QueueId,
    ) -> Result<bool, Error> {
        let removed = sqlx::query(&format!(
            "DELETE FROM {} WHERE QueueID = $1",
            tables.meta_errors
        ))
        .bind(queue_id)
        .execute(&mut *db)
        .await?
        .rows_affected();

        if removed == 0 {
            return Ok(false);
        }
        Self::delete_body(db, tables, options, queue_id).await?;
        Ok(true)
    }

    /// Lease compare-and-swap.
    pub async fn renew_lease(
        db: &mut SqliteConnection,
        tables: &TableNames,
        queue_id: QueueId,
        expected: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET HeartBeat = $1 WHERE QueueID = $2 AND Status = 'processing' AND HeartBeat = $3",
            tables.meta
        ))
        .bind(to_millis(now))
        .bind(queue_id)
        .bind(to_millis(expected))
        .execute(db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn expired_leases(
        db: &mut SqliteConnection,
        tables: &TableNames,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ExpiredLease>, Error> {
        let query = format!(
            "SELECT QueueID, HeartBeat FROM {} WHERE Status = 'processing' AND HeartBeat < $1",
            tables.meta
        );
        let mut stream = sqlx::query_as::<_, LeaseRow>(&query)
            .bind(to_millis(older_than))
            .fetch(db);

        let mut leases = Vec::new();

        while let Some(row) = stream.next().await.transpose()? {
            leases.push(ExpiredLease {
                queue_id: row.queue_id,
                heartbeat: from_millis(row.heartbeat),
            });
        }

        Ok(leases)
    }

    pub async fn expired_messages(
        db: &mut SqliteConnection,
        tables: &TableNames,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueId>, Error> {
        Ok(sqlx::query_scalar(&format!(
            "
            SELECT QueueID FROM {} WHERE Status = 'waiting'
                AND ExpirationTime IS NOT NULL AND ExpirationTime < $1
            ",
            tables.meta
        ))
        .bind(to_millis(now))
        .fetch_all(db)
        .await?)
    }

    pub async fn old_errors(
        db: &mut SqliteConnection,
        tables: &TableNames,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<QueueId>, Error> {
        Ok(sqlx::query_scalar(&format!(
            "SELECT QueueID FROM {} WHERE LastExceptionDate < $1",
            tables.meta_errors
        ))
        .bind(to_millis(older_than))
        .fetch_all(db)
        .await?)
    }

    pub async fn retry_count(
        db: &mut SqliteConnection,
        tables: &TableNames,
        queue_id: QueueId,
        exception_type: &str,
    ) -> Result<u32, Error> {
        let count: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT RetryCount FROM {} WHERE QueueID = $1 AND ExceptionType = $2",
            tables.error_tracking
        ))
        .bind(queue_id)
        .bind(exception_type)
        .fetch_optional(db)
        .await?;

        Ok(count.unwrap_or(0).max(0) as u32)
    }

    pub async fn increment_retry_count(
        db: &mut SqliteConnection,
        tables: &TableNames,
        queue_id: QueueId,
        exception_type: &str,
    ) -> Result<(), Error> {
        sqlx::query(&format!(
            "
            INSERT INTO {} (QueueID, ExceptionType, RetryCount) VALUES ($1, $2, 1)
            ON CONFLICT (QueueID, ExceptionType) DO UPDATE SET RetryCount = RetryCount + 1
            ",
            tables.error_tracking
        ))
        .bind(queue_id)
        .bind(exception_type)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn counts(
        db: &mut SqliteConnection,
        tables: &TableNames,
    ) -> Result<(i64, i64, i64), Error> {
        Ok(sqlx::query_as(&format!(
            "
            SELECT
                (SELECT COUNT(*) FROM {meta} WHERE Status = 'waiting'),
                (SELECT COUNT(*) FROM {meta} WHERE Status = 'processing'),
                (SELECT COUNT(*) FROM {errors})
            ",
            meta = tables.meta,
            errors = tables.meta_errors
        ))
        .fetch_one(db)
        .await?)
    }

    pub async fn job_event_time(
        db: &mut SqliteConnection,
        tables: &TableNames,
        job_name: &str,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        let time: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT JobEventTime FROM {} WHERE JobName = $1",
            tables.job
        ))
        .bind(job_name)
        .fetch_optional(db)
        .await?;

        Ok(time.map(from_millis))
    }
}
