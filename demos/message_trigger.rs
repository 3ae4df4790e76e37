//! Drains a queue into storage three times: once cleanly, once with a
//! storage commit failure and once with a messaging failure after the
//! storage commit.
//!
//! ```sh
//! RUST_LOG=dualcommit=debug cargo run --example message_trigger
//! ```

use dualcommit::{
    InMemoryBroker, InMemoryStorage, QueueName, StorageInspector, TransactionCoordinator,
    TriggerConfig, TriggerHandler,
};
use dualcommit_testing::{FailureSimulator, FaultyMessaging, FaultyStorage, MessagingFailure};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = TriggerConfig::from_json(r#"{ "queue": "orders", "first_id": 1 }"#)?;
    let queue: QueueName = config.queue.clone();
    let broker = InMemoryBroker::new();
    let storage = InMemoryStorage::new();
    let simulator = FailureSimulator::new();
    let coordinator = TransactionCoordinator::new(
        FaultyMessaging::new(broker.clone(), simulator.clone()),
        FaultyStorage::new(storage.clone(), simulator.clone()),
    );
    let handler = TriggerHandler::from_config(&config);

    let _ = broker.publish(&queue, "foo");
    let _ = broker.publish(&queue, "bar");
    let written = handler.run_trigger(&coordinator).await?;
    info!(written, "clean pass");

    let _ = broker.publish(&queue, "baz");
    simulator.fail_next_storage_commit();
    match handler.run_trigger(&coordinator).await {
        Ok(written) => info!(written, "unexpected success"),
        Err(failure) if failure.is_retryable() => {
            warn!(%failure, pending = broker.depth(&queue), "retryable failure, messages kept");
        }
        Err(failure) => return Err(failure.into()),
    }

    let deleted = storage_clear(&storage).await?;
    info!(deleted, "cleared stored records");
    simulator.fail_next_messaging_commit(MessagingFailure::AfterAcknowledge);
    match handler.run_trigger(&coordinator).await {
        Ok(written) => info!(written, "unexpected success"),
        Err(failure) if failure.violates_atomicity() => {
            error!(
                %failure,
                stored = storage.count_rows(dualcommit::Table::Records).await?,
                pending = broker.depth(&queue),
                "records committed but messages were not acknowledged"
            );
        }
        Err(failure) => return Err(failure.into()),
    }

    Ok(())
}

async fn storage_clear(storage: &InMemoryStorage) -> Result<u64, dualcommit::StorageError> {
    use dualcommit::{Statement, StorageResource, StorageSession, Table};

    let mut session = storage.begin().await?;
    let deleted = session.execute(Statement::DeleteAll(Table::Records)).await?;
    session.commit().await?;
    Ok(deleted)
}
