//! Message types and status management for the work queue.
//!
//! Messages flow through the queue in three observable states. A producer inserts
//! a message as `Waiting`; a worker claims it (`Processing`, with a lease timestamp);
//! the worker then either commits (the rows are deleted), rolls back (`Waiting`
//! again, possibly delayed) or moves it to the error table (`Error`).
//!
//! The backing store is the single source of truth. Nothing here caches state
//! across calls; a [`ReceivedMessage`] only lives for the duration of one attempt.

use std::{collections::HashMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use rand::distributions::{Alphanumeric, DistString};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Error;

/// Store-assigned identity of a message. Unique and immutable once assigned.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct QueueId(pub i64);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current status of a message row.
///
/// The only valid transition into `Processing` is from `Waiting`, and a row in
/// `Processing` always carries a lease timestamp.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display,
)]
#[sqlx(type_name = "text")]
pub enum MessageStatus {
    /// Waiting to be claimed
    #[serde(rename = "waiting")]
    #[sqlx(rename = "waiting")]
    #[strum(serialize = "waiting")]
    Waiting,
    /// Claimed by a worker which holds the lease
    #[serde(rename = "processing")]
    #[sqlx(rename = "processing")]
    #[strum(serialize = "processing")]
    Processing,
    /// Retries exhausted; the message lives on in the error table
    #[serde(rename = "error")]
    #[sqlx(rename = "error")]
    #[strum(serialize = "error")]
    Error,
}

/// Well-known header names.
pub mod headers {
    pub const RPC_TIMEOUT: &str = "relayq-rpc-timeout";
    pub const RPC_RESPONSE_ID: &str = "relayq-rpc-response-id";
    pub const DELAY: &str = "relayq-delay";
    pub const EXPIRATION: &str = "relayq-expiration";
}

/// Message headers, internal and user supplied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(HashMap<String, serde_json::Value>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Serialize) -> Result<(), Error> {
        self.0.insert(name.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.0
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn extend(&mut self, other: &Headers) {
        self.0
            .extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    fn duration(&self, name: &str) -> Option<Duration> {
        self.get::<u64>(name).map(Duration::from_millis)
    }

    fn set_duration(&mut self, name: &str, value: Duration) {
        self.0
            .insert(name.to_owned(), (value.as_millis() as u64).into());
    }

    pub fn rpc_timeout(&self) -> Option<Duration> {
        self.duration(headers::RPC_TIMEOUT)
    }

    pub fn set_rpc_timeout(&mut self, timeout: Duration) {
        self.set_duration(headers::RPC_TIMEOUT, timeout)
    }

    pub fn rpc_response_id(&self) -> Option<String> {
        self.get(headers::RPC_RESPONSE_ID)
    }

    pub fn set_rpc_response_id(&mut self, id: impl Into<String>) {
        self.0
            .insert(headers::RPC_RESPONSE_ID.to_owned(), id.into().into());
    }

    pub fn delay(&self) -> Option<Duration> {
        self.duration(headers::DELAY)
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.set_duration(headers::DELAY, delay)
    }

    pub fn expiration(&self) -> Option<Duration> {
        self.duration(headers::EXPIRATION)
    }

    pub fn set_expiration(&mut self, expiration: Duration) {
        self.set_duration(headers::EXPIRATION, expiration)
    }
}

/// A message to be sent: a body plus headers.
#[derive(Debug, Clone)]
pub struct Message<T> {
    pub body: T,
    pub headers: Headers,
}

impl<T> Message<T> {
    pub fn new(body: T) -> Self {
        Self {
            body,
            headers: Headers::new(),
        }
    }
}

type ExpirationGetter = Box<dyn Fn() -> Option<Duration> + Send + Sync>;

/// Per-send data that does not belong to the body.
#[derive(Default)]
pub struct AdditionalMessageData {
    pub correlation_id: Option<String>,
    pub headers: Headers,
    pub delay: Option<Duration>,
    expiration: Option<ExpirationGetter>,
}

impl AdditionalMessageData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(Box::new(move || Some(expiration)));
        self
    }

    pub fn with_expiration_getter(
        mut self,
        getter: impl Fn() -> Option<Duration> + Send + Sync + 'static,
    ) -> Self {
        self.expiration = Some(Box::new(getter));
        self
    }

    /// Resolves how long the message may wait before it expires.
    ///
    /// Priority: RPC timeout in these headers, then the message's own RPC timeout
    /// header, then the expiration getter. The first non-zero value wins.
    pub fn resolve_expiration(&self, message_headers: &Headers) -> Option<Duration> {
        let getter = self.expiration.as_ref().and_then(|g| g());
        [
            self.headers.rpc_timeout(),
            message_headers.rpc_timeout(),
            getter,
        ]
        .into_iter()
        .flatten()
        .find(|d| !d.is_zero())
    }

    /// Delay from the explicit setting, falling back to the delay header.
    pub fn resolve_delay(&self, message_headers: &Headers) -> Option<Duration> {
        self.delay
            .or_else(|| self.headers.delay())
            .or_else(|| message_headers.delay())
            .filter(|d| !d.is_zero())
    }

    pub(crate) fn correlation_id_or_new(&self) -> String {
        self.correlation_id
            .clone()
            .unwrap_or_else(|| Alphanumeric.sample_string(&mut rand::thread_rng(), 32))
    }
}

/// Codec used for message bodies. Its name is stored as the interceptor graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString)]
pub enum MessageCodec {
    #[default]
    #[strum(serialize = "json")]
    Json,
    #[strum(serialize = "bincode")]
    Bincode,
}

impl MessageCodec {
    pub fn encode<T: Serialize>(&self, body: &T) -> Result<Vec<u8>, Error> {
        Ok(match self {
            Self::Json => serde_json::to_vec(body)?,
            Self::Bincode => bincode::serialize(body)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Error> {
        Ok(match self {
            Self::Json => serde_json::from_slice(bytes)?,
            Self::Bincode => bincode::deserialize(bytes)?,
        })
    }
}

/// An encoded message ready for insertion.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub correlation_id: String,
    pub body: Vec<u8>,
    pub codec: MessageCodec,
    pub headers: Headers,
    pub delay: Option<Duration>,
    pub expiration: Option<Duration>,
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub queue_id: QueueId,
    pub correlation_id: String,
}

/// A claimed row as returned by the store, body still encoded.
#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    pub queue_id: QueueId,
    pub correlation_id: String,
    pub body: Vec<u8>,
    pub codec: MessageCodec,
    pub headers: Headers,
    pub queued_at: DateTime<Utc>,
    pub lease: DateTime<Utc>,
}

/// A decoded message handed to a handler for one processing attempt.
#[derive(Debug, Clone)]
pub struct ReceivedMessage<T> {
    pub queue_id: QueueId,
    pub correlation_id: String,
    pub body: T,
    pub headers: Headers,
    pub queued_at: DateTime<Utc>,
}

/// Scheduler metadata for job messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMetadata {
    pub job_name: String,
    pub scheduled_time: DateTime<Utc>,
    pub event_time: DateTime<Utc>,
}

/// Lease values are stored as UTC milliseconds; equality is what the CAS compares.
pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiration_priority_prefers_additional_rpc_timeout() {
        let mut message_headers = Headers::new();
        message_headers.set_rpc_timeout(Duration::from_secs(20));

        let mut data = AdditionalMessageData::new().with_expiration(Duration::from_secs(30));
        data.headers.set_rpc_timeout(Duration::from_secs(10));

        assert_eq!(
            data.resolve_expiration(&message_headers),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn expiration_skips_zero_values() {
        let mut message_headers = Headers::new();
        message_headers.set_rpc_timeout(Duration::ZERO);

        let data = AdditionalMessageData::new().with_expiration(Duration::from_secs(30));
        assert_eq!(
            data.resolve_expiration(&message_headers),
            Some(Duration::from_secs(30))
        );

        let none = AdditionalMessageData::new();
        assert_eq!(none.resolve_expiration(&Headers::new()), None);
    }

    #[test]
    fn codec_name_roundtrips_through_string() {
        let codec: MessageCodec = MessageCodec::Bincode.to_string().parse().unwrap();
        assert_eq!(codec, MessageCodec::Bincode);
    }

    #[test]
    fn generated_correlation_ids_are_unique() {
        let data = AdditionalMessageData::new();
        assert_ne!(data.correlation_id_or_new(), data.correlation_id_or_new());
        let fixed = AdditionalMessageData::new().with_correlation_id("abc");
        assert_eq!(fixed.correlation_id_or_new(), "abc");
    }
}
