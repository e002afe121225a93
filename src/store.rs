//! The backing store seam.
//!
//! Workers, the heartbeat subsystem and the monitors are written purely against
//! [`MessageStore`]. Mutual exclusion across processes comes entirely from the
//! store's conditional updates: a claim or lease transition that lost a race
//! affects zero rows and is reported as `None`/`false`, never as an error.
//!
//! Every operation on an unprovisioned store (empty connection string) returns an
//! empty or zero result, except [`MessageStore::send`]: a message cannot be
//! dropped silently, so sending fails with [`Error::InvalidArgument`].

use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
    error::Error,
    message::{ClaimedMessage, JobMetadata, OutboundMessage, QueueId, SentMessage},
};

/// A lease judged stale by a scan, with the value it held when observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredLease {
    pub queue_id: QueueId,
    pub heartbeat: DateTime<Utc>,
}

/// Counts of messages per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStatus {
    pub waiting: u64,
    pub processing: u64,
    pub error: u64,
}

impl QueueStatus {
    pub fn total(&self) -> u64 {
        self.waiting + self.processing + self.error
    }
}

pub trait MessageStore: Send + Sync + 'static {
    /// False when there is no connection string; every call except `send` is then
    /// a no-op.
    fn is_provisioned(&self) -> bool;

    /// Inserts body, meta and status rows. With `job`, the (name, scheduled time)
    /// pair is recorded atomically and a duplicate fails with
    /// [`Error::JobAlreadyQueued`]. Fails with [`Error::InvalidArgument`] on an
    /// unprovisioned store.
    fn send(
        &self,
        message: OutboundMessage,
        job: Option<JobMetadata>,
    ) -> impl Future<Output = Result<SentMessage, Error>> + Send;

    /// Cheap connectivity check used before fanning out a batch.
    fn ping(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Claims at most one eligible message: `Waiting` to `Processing` with
    /// `lease = now`, atomically with its selection.
    fn receive(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<ClaimedMessage>, Error>> + Send;

    /// Deletes every row belonging to the message. Returns the number of meta
    /// rows removed, so a second commit returns 0.
    fn commit(&self, queue_id: QueueId) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Releases the claim. With `last_known_lease` the update only applies while
    /// the lease still holds that value. With `increase_delay_by` the message
    /// becomes eligible again only after that delay.
    fn rollback(
        &self,
        queue_id: QueueId,
        last_known_lease: Option<DateTime<Utc>>,
        increase_delay_by: Option<Duration>,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Copies the message into the error table with the error text, removes it from
    /// the main table and marks it `Error`, in one transaction.
    fn move_to_error(
        &self,
        queue_id: QueueId,
        error: &str,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Lease compare-and-swap: moves the lease from `expected` to `now` while the
    /// message is still `Processing`. `None` means the lease was lost.
    fn try_renew_lease(
        &self,
        queue_id: QueueId,
        expected: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, Error>> + Send;

    fn find_expired_leases(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<ExpiredLease>, Error>> + Send;

    /// `Processing` to `Waiting` if the lease still holds the observed value.
    /// `false` means the owner finished or renewed in the meantime.
    fn reset_lease(&self, lease: ExpiredLease) -> impl Future<Output = Result<bool, Error>> + Send;

    fn find_expired_messages(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<QueueId>, Error>> + Send;

    /// Deletes a message only while it is still `Waiting`.
    fn delete_waiting_message(
        &self,
        queue_id: QueueId,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    fn find_old_errors(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<QueueId>, Error>> + Send;

    fn delete_error_message(
        &self,
        queue_id: QueueId,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    fn error_retry_count(
        &self,
        queue_id: QueueId,
        exception_type: &str,
    ) -> impl Future<Output = Result<u32, Error>> + Send;

    fn increment_error_count(
        &self,
        queue_id: QueueId,
        exception_type: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn queue_status(&self) -> impl Future<Output = Result<QueueStatus, Error>> + Send;

    fn last_job_event_time(
        &self,
        job_name: &str,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, Error>> + Send;
}
