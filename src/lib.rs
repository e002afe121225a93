use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
pub mod db;
pub mod delay;
pub mod error;
pub mod heartbeat;
pub mod lease;
pub mod message;
pub mod monitor;
pub mod queue;
pub mod retry;
pub mod store;
pub mod worker;

pub use db::{QueueOptions, SqliteStore};
pub use error::Error;
pub use message::{AdditionalMessageData, Message, MessageCodec, QueueId, ReceivedMessage};
pub use queue::{ConsumerQueue, ProducerQueue};
pub use store::MessageStore;
pub use worker::{MessageHandler, ShutdownReport, WorkerNotification};

/// Installs the global tracing subscriber. Pretty output in debug builds, JSON in
/// release builds; the filter is read from `RELAYQ_LOG` and defaults to `info`.
pub fn init_tracing() -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("RELAYQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("RELAYQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    Ok(())
}
