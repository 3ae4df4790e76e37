//! Contracts for the two transactional resources a scope enlists.
//!
//! A resource is a long-lived, shareable handle (a broker connection, a
//! database pool). Calling `begin` checks out a *session*: an exclusive,
//! transactional view of that resource owned by exactly one scope. Sessions
//! are completed by value (`commit(self)` / `rollback(self)`), so a session
//! cannot be used after it has been completed. A session dropped without
//! being completed must behave as if it had been rolled back.
//!
//! Implementations in this workspace:
//! - [`InMemoryBroker`](crate::InMemoryBroker) and
//!   [`InMemoryStorage`](crate::InMemoryStorage): development and tests
//! - `dualcommit-postgres`: PostgreSQL storage
//! - `dualcommit-testing`: failure-injecting wrappers around any of the above

use std::future::Future;
use std::time::Duration;

use crate::errors::{MessagingError, StorageError};
use crate::types::{AuditEntry, Message, QueueName, Record, RecordId, Statement, Table};

/// How long a receive may wait for a message to arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiveWait {
    /// Return `None` at once when the queue is empty.
    #[default]
    Immediate,
    /// Wait at most this long for a message.
    Within(Duration),
}

/// A message broker able to open transacted sessions.
pub trait MessagingResource: Send + Sync {
    /// Session type handed to a scope.
    type Session: MessagingSession;

    /// Open a new transacted session.
    fn begin(&self) -> impl Future<Output = Result<Self::Session, MessagingError>> + Send;
}

/// A transacted broker session owned by one scope.
pub trait MessagingSession: Send {
    /// Take the next message from `queue`.
    ///
    /// The message is hidden from every other session until this one
    /// completes. On rollback it becomes available again.
    fn receive(
        &mut self,
        queue: &QueueName,
        wait: ReceiveWait,
    ) -> impl Future<Output = Result<Option<Message>, MessagingError>> + Send;

    /// Send `payload` to `queue`; visible to receivers only after commit.
    fn send(
        &mut self,
        queue: &QueueName,
        payload: String,
    ) -> impl Future<Output = Result<(), MessagingError>> + Send;

    /// Acknowledge everything received and publish everything sent.
    fn commit(self) -> impl Future<Output = Result<(), MessagingError>> + Send;

    /// Return every received message to its queue and discard sends.
    fn rollback(self) -> impl Future<Output = Result<(), MessagingError>> + Send;
}

/// A database able to open transactions.
pub trait StorageResource: Send + Sync {
    /// Session type handed to a scope.
    type Session: StorageSession;

    /// Open a new transaction.
    fn begin(&self) -> impl Future<Output = Result<Self::Session, StorageError>> + Send;
}

/// A database transaction owned by one scope.
pub trait StorageSession: Send {
    /// Apply `statement` inside the transaction and return the number of
    /// affected rows.
    fn execute(
        &mut self,
        statement: Statement,
    ) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Count rows of `table` as seen by this transaction, including its own
    /// uncommitted writes.
    fn count_rows(&mut self, table: Table)
    -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Make every write of the transaction durable and visible.
    fn commit(self) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Discard every write of the transaction.
    fn rollback(self) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Read access to committed storage state, for assertions and monitoring.
pub trait StorageInspector: Send + Sync {
    /// Count committed rows of `table`.
    fn count_rows(&self, table: Table) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Look up a committed record by id.
    fn find_record(
        &self,
        id: RecordId,
    ) -> impl Future<Output = Result<Option<Record>, StorageError>> + Send;

    /// All committed records ordered by id.
    fn records(&self) -> impl Future<Output = Result<Vec<Record>, StorageError>> + Send;

    /// All committed audit entries in insertion order.
    fn audits(&self) -> impl Future<Output = Result<Vec<AuditEntry>, StorageError>> + Send;
}
