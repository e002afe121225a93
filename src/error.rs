use snafu::Snafu;

use crate::message::QueueId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{what} has already been started"))]
    AlreadyStarted { what: String },

    #[snafu(display("{what} has been disposed"))]
    Disposed { what: String },

    #[snafu(display("{what} has not been started"))]
    NotStarted { what: String },

    #[snafu(display("Invalid argument: {message}"))]
    InvalidArgument { message: String },

    #[snafu(display("{what} is read-only and can no longer be modified"))]
    ReadOnly { what: String },

    #[snafu(display("A retry schedule is already registered for {type_name}"))]
    DuplicateRetryRegistration { type_name: String },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Failed to execute queue creation script: {script}"))]
    Creation {
        script: String,
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Queue {name} already exists"))]
    QueueExists { name: String },

    #[snafu(display("Failed to (de)serialize message body"))]
    Serialization {
        #[snafu(source(false))]
        source: eyre::Report,
    },

    #[snafu(display("Message {queue_id} could not be decoded and is poisoned"))]
    PoisonMessage {
        queue_id: QueueId,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display("Error handling failed for message {queue_id}"))]
    ErrorHandlerCrashed {
        queue_id: QueueId,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display("Job {job_name} is already queued for {scheduled_time}"))]
    JobAlreadyQueued {
        job_name: String,
        scheduled_time: chrono::DateTime<chrono::Utc>,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(eyre::Report, Some)))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization { source: e.into() }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization { source: e.into() }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::Whatever {
            message: e.to_string(),
            source: Some(e),
        }
    }
}

impl Error {
    pub fn already_started(what: impl Into<String>) -> Self {
        Self::AlreadyStarted { what: what.into() }
    }

    pub fn disposed(what: impl Into<String>) -> Self {
        Self::Disposed { what: what.into() }
    }

    pub fn not_started(what: impl Into<String>) -> Self {
        Self::NotStarted { what: what.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn read_only(what: impl Into<String>) -> Self {
        Self::ReadOnly { what: what.into() }
    }

    /// True for errors caused by misuse of the API rather than by the store or a handler.
    ///
    /// These are surfaced to the caller immediately and never retried.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::AlreadyStarted { .. }
                | Self::Disposed { .. }
                | Self::NotStarted { .. }
                | Self::InvalidArgument { .. }
                | Self::ReadOnly { .. }
                | Self::DuplicateRetryRegistration { .. }
        )
    }

    /// True when the error means the queue tables do not exist yet.
    pub(crate) fn is_missing_table(&self) -> bool {
        match self {
            Self::Sqlx {
                source: sqlx::Error::Database(db),
            } => db.message().contains("no such table"),
            _ => false,
        }
    }
}
