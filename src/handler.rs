//! The trigger handler: one record per received message.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::TriggerConfig;
use crate::coordinator::{TransactionCoordinator, TransactionScope};
use crate::errors::{TransactionResult, TriggerError};
use crate::resource::{MessagingResource, MessagingSession, StorageResource, StorageSession};
use crate::types::{Message, QueueName, Record, RecordId, RecordName, Statement};

/// Chooses the primary key of the record built from a message.
///
/// Ids must be reproducible for a replayed message so the storage resource
/// can reject the duplicate. Closures of the form
/// `Fn(&Message, usize) -> RecordId` implement this trait.
pub trait AssignId: Send + Sync {
    /// Id for `message`, the `position`-th message of the current pass.
    fn assign(&self, message: &Message, position: usize) -> RecordId;
}

impl<F> AssignId for F
where
    F: Fn(&Message, usize) -> RecordId + Send + Sync,
{
    fn assign(&self, message: &Message, position: usize) -> RecordId {
        self(message, position)
    }
}

/// Numbers records `first`, `first + 1`, ... within each handling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sequential {
    /// Id of the first record of a pass.
    pub first: RecordId,
}

impl Sequential {
    /// Sequence starting at `first`.
    pub const fn starting_at(first: RecordId) -> Self {
        Self { first }
    }
}

impl Default for Sequential {
    fn default() -> Self {
        Self::starting_at(RecordId::new(0))
    }
}

impl AssignId for Sequential {
    fn assign(&self, _message: &Message, position: usize) -> RecordId {
        let offset = i64::try_from(position).unwrap_or(i64::MAX);
        RecordId::new(self.first.into_inner().saturating_add(offset))
    }
}

/// Drains a queue inside a transaction scope and writes one record per
/// message.
///
/// The handler also keeps a count of records whose scope committed, which
/// tests and monitors can await through [`wait_for_processed`].
///
/// [`wait_for_processed`]: TriggerHandler::wait_for_processed
pub struct TriggerHandler<A = Sequential> {
    queue: QueueName,
    ids: A,
    processed: watch::Sender<usize>,
}

impl TriggerHandler<Sequential> {
    /// Handler for `queue` numbering records from 0.
    pub fn new(queue: QueueName) -> Self {
        Self::with_ids(queue, Sequential::default())
    }

    /// Handler built from configuration.
    pub fn from_config(config: &TriggerConfig) -> Self {
        Self::with_ids(config.queue.clone(), Sequential::starting_at(config.first_id))
    }
}

impl<A: AssignId> TriggerHandler<A> {
    /// Handler for `queue` using a custom id strategy.
    pub fn with_ids(queue: QueueName, ids: A) -> Self {
        let (processed, _) = watch::channel(0);
        Self {
            queue,
            ids,
            processed,
        }
    }

    /// The queue this handler drains.
    pub const fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Drain the queue through `scope` and write one record per message.
    ///
    /// Stops at the first empty receive and never waits for more messages.
    /// Records are written in receive order. Returns how many were written.
    ///
    /// # Errors
    ///
    /// Any receive or write failure, or a payload that is not a valid
    /// [`RecordName`], aborts the pass. Records already written in the pass
    /// stay in the scope; the caller decides whether to roll back.
    pub async fn handle<M, S>(&self, scope: &mut TransactionScope<M, S>) -> Result<usize, TriggerError>
    where
        M: MessagingSession,
        S: StorageSession,
    {
        let mut written = 0;

        while let Some(message) = scope.try_receive(&self.queue).await? {
            let name = RecordName::try_new(message.payload.clone()).map_err(|error| {
                TriggerError::InvalidPayload {
                    message: message.id,
                    reason: error.to_string(),
                }
            })?;
            let id = self.ids.assign(&message, written);

            debug!(
                record = %id,
                message = %message.id,
                redelivery = message.is_redelivery(),
                "writing record"
            );
            let _ = scope
                .execute(Statement::InsertRecord(Record::new(id, name)))
                .await?;
            written += 1;
        }

        Ok(written)
    }

    /// Run [`handle`](Self::handle) in a new scope of `coordinator` and
    /// publish the written count once storage has committed.
    ///
    /// The count is also published when messaging fails after storage
    /// committed, since those records are durable.
    pub async fn run_trigger<M, S>(
        &self,
        coordinator: &TransactionCoordinator<M, S>,
    ) -> TransactionResult<usize, TriggerError>
    where
        M: MessagingResource,
        S: StorageResource,
    {
        let mut written = 0;

        let result = coordinator
            .run_in_transaction(async |scope| {
                let count = self.handle(scope).await?;
                written = count;
                Ok::<_, TriggerError>(count)
            })
            .await;

        match &result {
            Ok(count) => self.publish(*count),
            Err(error) if error.violates_atomicity() => self.publish(written),
            Err(_) => {}
        }
        result
    }

    fn publish(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.processed.send_modify(|processed| *processed += count);
        info!(count, total = self.processed(), "records committed");
    }

    /// Records written by committed scopes since creation or the last reset.
    pub fn processed(&self) -> usize {
        *self.processed.borrow()
    }

    /// Set the processed count back to zero.
    pub fn reset_processed(&self) {
        let _ = self.processed.send_replace(0);
    }

    /// A receiver that observes every change of the processed count.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.processed.subscribe()
    }

    /// Wait until at least `target` records have been processed.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for_processed(&self, target: usize, timeout: Duration) -> bool {
        let mut processed = self.processed.subscribe();
        tokio::time::timeout(timeout, processed.wait_for(|count| *count >= target))
            .await
            .is_ok_and(|changed| changed.is_ok())
    }
}
