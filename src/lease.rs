//! The lease a worker holds on a claimed message.
//!
//! A lease is the `HeartBeat` timestamp of a `Processing` row. The holder renews
//! it with a compare-and-swap against the last value it wrote; anyone else may
//! reset it once it is older than the staleness threshold, again by
//! compare-and-swap against the value they observed. Whichever update lands
//! second affects zero rows, which is how both sides learn they lost.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::{DateTime, Utc};

use crate::{
    error::Error,
    message::{from_millis, to_millis, QueueId},
    store::MessageStore,
};

#[derive(Debug)]
pub struct Lease {
    queue_id: QueueId,
    current: AtomicI64,
    lost: AtomicBool,
}

impl Lease {
    pub fn new(queue_id: QueueId, acquired_at: DateTime<Utc>) -> Self {
        Self {
            queue_id,
            current: AtomicI64::new(to_millis(acquired_at)),
            lost: AtomicBool::new(false),
        }
    }

    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    /// The last lease value this process wrote.
    pub fn current(&self) -> DateTime<Utc> {
        from_millis(self.current.load(Ordering::Acquire))
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Moves the lease forward to `now`. Returns false once the lease is lost; a
    /// lost lease is never renewed again.
    pub async fn renew<S: MessageStore>(&self, store: &S, now: DateTime<Utc>) -> Result<bool, Error> {
        if self.is_lost() {
            return Ok(false);
        }

        match store
            .try_renew_lease(self.queue_id, self.current(), now)
            .await?
        {
            Some(renewed) => {
                self.current.store(to_millis(renewed), Ordering::Release);
                Ok(true)
            }
            None => {
                self.lost.store(true, Ordering::Release);
                Ok(false)
            }
        }
    }
}

/// Returns every `Processing` message whose lease is older than `older_than` to
/// `Waiting`. Only the messages actually reset are returned; a row whose owner
/// renewed or finished since the scan is skipped.
pub async fn reset_stale_leases<S: MessageStore>(
    store: &S,
    older_than: DateTime<Utc>,
) -> Result<Vec<QueueId>, Error> {
    let expired = store.find_expired_leases(older_than).await?;

    let mut reset = Vec::with_capacity(expired.len());
    for lease in expired {
        if store.reset_lease(lease).await? {
            tracing::info!(queue_id = %lease.queue_id, heartbeat = %lease.heartbeat, "reset stale lease");
            reset.push(lease.queue_id);
        } else {
            tracing::debug!(queue_id = %lease.queue_id, "stale lease changed before reset");
        }
    }

    Ok(reset)
}
