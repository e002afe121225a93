//! Per error type retry schedules.
//!
//! A handler failure is classified by walking the error chain of its
//! [`eyre::Report`], outermost context first, down to the root cause. The first
//! link whose concrete type has a registered schedule decides. A catch-all
//! schedule, registered with [`RetryPolicy::register_any`], applies when no link
//! matched. Nothing registered means zero retries, which is a valid setup.

use std::{any::TypeId, error::Error as StdError, time::Duration};

use crate::error::Error;

/// Name recorded in error tracking when the catch-all schedule matched.
pub const ANY_ERROR: &str = "*";

type Matcher = fn(&(dyn StdError + 'static)) -> bool;

fn is_type<E: StdError + 'static>(err: &(dyn StdError + 'static)) -> bool {
    err.is::<E>()
}

#[derive(Clone)]
struct RetryEntry {
    type_id: TypeId,
    type_name: &'static str,
    matches: Matcher,
    delays: Vec<Duration>,
}

impl std::fmt::Debug for RetryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEntry")
            .field("type_name", &self.type_name)
            .field("delays", &self.delays)
            .finish()
    }
}

/// How a failure should be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryInformation {
    /// The registered type that matched, or [`ANY_ERROR`]; `None` when nothing matched.
    pub exception_type: Option<String>,
    pub max_retries: usize,
    pub delays: Vec<Duration>,
}

impl RetryInformation {
    fn none() -> Self {
        Self {
            exception_type: None,
            max_retries: 0,
            delays: Vec::new(),
        }
    }

    /// Key used by error tracking. Unmatched errors share one bucket.
    pub fn tracking_key(&self) -> &str {
        self.exception_type.as_deref().unwrap_or(ANY_ERROR)
    }

    /// Delay for the retry following `failures` previous failures, if any remain.
    pub fn delay_for(&self, failures: usize) -> Option<Duration> {
        if failures < self.max_retries {
            Some(self.delays[failures])
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    entries: Vec<RetryEntry>,
    any: Option<Vec<Duration>>,
    read_only: bool,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schedule for a concrete error type.
    ///
    /// Registering the same type twice is a configuration error.
    pub fn register<E>(&mut self, delays: impl IntoIterator<Item = Duration>) -> Result<(), Error>
    where
        E: StdError + 'static,
    {
        if self.read_only {
            return Err(Error::read_only("retry policy"));
        }
        let type_id = TypeId::of::<E>();
        let type_name = std::any::type_name::<E>();
        if self.entries.iter().any(|e| e.type_id == type_id) {
            return Err(Error::DuplicateRetryRegistration {
                type_name: type_name.to_owned(),
            });
        }
        self.entries.push(RetryEntry {
            type_id,
            type_name,
            matches: is_type::<E>,
            delays: delays.into_iter().collect(),
        });
        Ok(())
    }

    /// Registers the catch-all schedule used when no concrete type matched.
    pub fn register_any(&mut self, delays: impl IntoIterator<Item = Duration>) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::read_only("retry policy"));
        }
        if self.any.is_some() {
            return Err(Error::DuplicateRetryRegistration {
                type_name: ANY_ERROR.to_owned(),
            });
        }
        self.any = Some(delays.into_iter().collect());
        Ok(())
    }

    pub fn retry_amount(&self, error: &eyre::Report) -> RetryInformation {
        for link in error.chain() {
            if let Some(entry) = self.entries.iter().find(|e| (e.matches)(link)) {
                return RetryInformation {
                    exception_type: Some(entry.type_name.to_owned()),
                    max_retries: entry.delays.len(),
                    delays: entry.delays.clone(),
                };
            }
        }

        match &self.any {
            Some(delays) => RetryInformation {
                exception_type: Some(ANY_ERROR.to_owned()),
                max_retries: delays.len(),
                delays: delays.clone(),
            },
            None => RetryInformation::none(),
        }
    }

    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}
