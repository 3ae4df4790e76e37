//! Resource wrappers that fail on demand.
//!
//! [`FaultyMessaging`] and [`FaultyStorage`] delegate to a real resource and
//! consult a [`FailureSimulator`] before each begin, commit and rollback.

use dualcommit::{
    AuditEntry, Message, MessagingError, MessagingResource, MessagingSession, QueueName,
    ReceiveWait, Record, RecordId, Statement, StorageError, StorageInspector, StorageResource,
    StorageSession, Table,
};
use tracing::warn;

use crate::simulator::{FailureSimulator, MessagingFailure};

/// A messaging resource whose begin, commit and rollback can be made to fail.
#[derive(Debug, Clone)]
pub struct FaultyMessaging<M> {
    inner: M,
    simulator: FailureSimulator,
}

impl<M> FaultyMessaging<M> {
    /// Wrap `inner`, consulting `simulator` for failures.
    pub const fn new(inner: M, simulator: FailureSimulator) -> Self {
        Self { inner, simulator }
    }

    /// The wrapped resource.
    pub const fn inner(&self) -> &M {
        &self.inner
    }
}

impl<M: MessagingResource> MessagingResource for FaultyMessaging<M> {
    type Session = FaultyMessagingSession<M::Session>;

    async fn begin(&self) -> Result<Self::Session, MessagingError> {
        if self.simulator.take_messaging_begin() {
            warn!("injecting messaging begin failure");
            return Err(MessagingError::Unavailable(
                "simulated broker outage".to_string(),
            ));
        }

        Ok(FaultyMessagingSession {
            inner: self.inner.begin().await?,
            simulator: self.simulator.clone(),
        })
    }
}

/// Session of a [`FaultyMessaging`].
#[derive(Debug)]
pub struct FaultyMessagingSession<S> {
    inner: S,
    simulator: FailureSimulator,
}

impl<S: MessagingSession> MessagingSession for FaultyMessagingSession<S> {
    async fn receive(
        &mut self,
        queue: &QueueName,
        wait: ReceiveWait,
    ) -> Result<Option<Message>, MessagingError> {
        self.inner.receive(queue, wait).await
    }

    async fn send(&mut self, queue: &QueueName, payload: String) -> Result<(), MessagingError> {
        self.inner.send(queue, payload).await
    }

    async fn commit(self) -> Result<(), MessagingError> {
        match self.simulator.take_messaging_commit() {
            None => self.inner.commit().await,
            Some(MessagingFailure::AfterAcknowledge) => {
                warn!("injecting messaging commit failure after acknowledge");
                self.inner.commit().await?;
                Err(MessagingError::CommitFailed(
                    "simulated loss of the commit acknowledgement".to_string(),
                ))
            }
            Some(MessagingFailure::Rejected) => {
                warn!("injecting messaging commit rejection");
                self.inner.rollback().await?;
                Err(MessagingError::CommitFailed(
                    "simulated broker rejection".to_string(),
                ))
            }
        }
    }

    async fn rollback(self) -> Result<(), MessagingError> {
        if self.simulator.take_messaging_rollback() {
            warn!("injecting messaging rollback failure");
            drop(self.inner);
            return Err(MessagingError::RollbackFailed(
                "simulated broker disconnect during rollback".to_string(),
            ));
        }
        self.inner.rollback().await
    }
}

/// A storage resource whose begin, commit and rollback can be made to fail.
#[derive(Debug, Clone)]
pub struct FaultyStorage<S> {
    inner: S,
    simulator: FailureSimulator,
}

impl<S> FaultyStorage<S> {
    /// Wrap `inner`, consulting `simulator` for failures.
    pub const fn new(inner: S, simulator: FailureSimulator) -> Self {
        Self { inner, simulator }
    }

    /// The wrapped resource.
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: StorageResource> StorageResource for FaultyStorage<S> {
    type Session = FaultyStorageSession<S::Session>;

    async fn begin(&self) -> Result<Self::Session, StorageError> {
        if self.simulator.take_storage_begin() {
            warn!("injecting storage begin failure");
            return Err(StorageError::Unavailable(
                "simulated connection pool exhaustion".to_string(),
            ));
        }

        Ok(FaultyStorageSession {
            inner: self.inner.begin().await?,
            simulator: self.simulator.clone(),
        })
    }
}

impl<S: StorageInspector> StorageInspector for FaultyStorage<S> {
    async fn count_rows(&self, table: Table) -> Result<u64, StorageError> {
        self.inner.count_rows(table).await
    }

    async fn find_record(&self, id: RecordId) -> Result<Option<Record>, StorageError> {
        self.inner.find_record(id).await
    }

    async fn records(&self) -> Result<Vec<Record>, StorageError> {
        self.inner.records().await
    }

    async fn audits(&self) -> Result<Vec<AuditEntry>, StorageError> {
        self.inner.audits().await
    }
}

/// Session of a [`FaultyStorage`].
#[derive(Debug)]
pub struct FaultyStorageSession<S> {
    inner: S,
    simulator: FailureSimulator,
}

impl<S: StorageSession> StorageSession for FaultyStorageSession<S> {
    async fn execute(&mut self, statement: Statement) -> Result<u64, StorageError> {
        self.inner.execute(statement).await
    }

    async fn count_rows(&mut self, table: Table) -> Result<u64, StorageError> {
        self.inner.count_rows(table).await
    }

    async fn commit(self) -> Result<(), StorageError> {
        if self.simulator.take_storage_commit() {
            warn!("injecting storage commit failure");
            self.inner.rollback().await?;
            return Err(StorageError::CommitFailed(
                "simulated storage commit failure".to_string(),
            ));
        }
        self.inner.commit().await
    }

    async fn rollback(self) -> Result<(), StorageError> {
        if self.simulator.take_storage_rollback() {
            warn!("injecting storage rollback failure");
            drop(self.inner);
            return Err(StorageError::RollbackFailed(
                "simulated connection loss during rollback".to_string(),
            ));
        }
        self.inner.rollback().await
    }
}
