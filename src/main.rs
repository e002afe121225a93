use std::sync::Arc;

use relayq::{
    config::Config, ConsumerQueue, QueueOptions, ReceivedMessage, SqliteStore, WorkerNotification,
};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    relayq::init_tracing()?;

    let config = Config::load()?;

    let store = SqliteStore::connect(config.db_path(), config.queue(), QueueOptions::default()).await?;
    if !store.queue_exists().await? {
        store.create_queue().await?;
    }
    let store = Arc::new(SqliteStore::open(config.db_path(), config.queue()).await?);

    let mut consumer = ConsumerQueue::<_, serde_json::Value, _>::builder()
        .store(store)
        .handler(
            |message: &ReceivedMessage<serde_json::Value>, notification: &WorkerNotification| -> eyre::Result<()> {
                tracing::info!(
                    queue_id = %message.queue_id,
                    correlation_id = %message.correlation_id,
                    worker_id = notification.worker_id(),
                    body = %message.body,
                    "received message"
                );
                Ok(())
            },
        )
        .build();

    consumer
        .configuration_mut()?
        .worker_mut()?
        .set_worker_count(config.workers())?;
    consumer.start()?;

    tracing::info!(queue = config.queue(), db = config.db_path(), "consuming, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    if let Some(report) = consumer.dispose().await {
        tracing::info!(?report, "shut down");
    }

    Ok(())
}
