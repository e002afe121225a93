//! Ordered backoff tables consulted by position.

use std::time::Duration;

use crate::error::Error;

/// An ordered sequence of delays; attempt `n` uses `schedule[min(n, len - 1)]`.
///
/// Used for the "no work found" wait and for the wait after a fatal transport
/// error in the claim and monitor loops. Mutable until [`DelayPolicy::set_read_only`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayPolicy {
    schedule: Vec<Duration>,
    read_only: bool,
}

impl DelayPolicy {
    pub fn new(schedule: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            schedule: schedule.into_iter().collect(),
            read_only: false,
        }
    }

    /// Default wait between empty polls of the queue.
    pub fn default_queue_delay() -> Self {
        let mut schedule = vec![Duration::from_millis(100); 10];
        schedule.extend([Duration::from_millis(250); 5]);
        schedule.extend([Duration::from_millis(500); 5]);
        schedule.extend([Duration::from_secs(1); 5]);
        schedule.push(Duration::from_secs(2));
        Self::new(schedule)
    }

    /// Default wait after the claim loop itself failed.
    pub fn default_fatal_exception_delay() -> Self {
        Self::new([
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(60),
        ])
    }

    pub fn add(&mut self, delay: Duration) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::read_only("delay policy"));
        }
        self.schedule.push(delay);
        Ok(())
    }

    pub fn clear(&mut self) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::read_only("delay policy"));
        }
        self.schedule.clear();
        Ok(())
    }

    /// Clamped positional lookup. An empty schedule never waits.
    pub fn get(&self, attempt: usize) -> Duration {
        match self.schedule.len() {
            0 => Duration::ZERO,
            len => self.schedule[attempt.min(len - 1)],
        }
    }

    pub fn len(&self) -> usize {
        self.schedule.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedule.is_empty()
    }

    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_clamped_to_last_entry() {
        let policy = DelayPolicy::new([
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(30),
        ]);

        assert_eq!(policy.get(0), Duration::from_millis(10));
        assert_eq!(policy.get(2), Duration::from_millis(30));
        for n in 3..50 {
            assert_eq!(policy.get(n), Duration::from_millis(30));
        }
        assert_eq!(policy.get(usize::MAX), Duration::from_millis(30));
    }

    #[test]
    fn empty_schedule_is_zero() {
        assert_eq!(DelayPolicy::new([]).get(4), Duration::ZERO);
    }

    #[test]
    fn locked_policy_rejects_mutation() {
        let mut policy = DelayPolicy::default_queue_delay();
        policy.add(Duration::from_secs(5)).unwrap();
        policy.set_read_only();

        assert!(matches!(
            policy.add(Duration::from_secs(1)),
            Err(Error::ReadOnly { .. })
        ));
        assert!(policy.clear().is_err());
        assert_eq!(policy.get(1000), Duration::from_secs(5));
    }
}
