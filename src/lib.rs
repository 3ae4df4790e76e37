//! `dualcommit` - best-effort transactions across a message broker and a
//! database.
//!
//! A [`TransactionCoordinator`] ties the receive of one or more messages to
//! the database writes derived from them. Both resources commit or roll back
//! together, with one documented exception: when the broker fails to commit
//! after the database already has, the records stay and the coordinator
//! returns [`TransactionError::MessagingCommitFailedAfterStorageCommit`].
//!
//! ```rust,ignore
//! use dualcommit::{InMemoryBroker, InMemoryStorage, TransactionCoordinator, TriggerHandler};
//!
//! let coordinator = TransactionCoordinator::new(InMemoryBroker::new(), InMemoryStorage::new());
//! let handler = TriggerHandler::new(QueueName::try_new("orders")?);
//!
//! match handler.run_trigger(&coordinator).await {
//!     Ok(written) => println!("stored {written} records"),
//!     Err(error) if error.violates_atomicity() => alert(&error),
//!     Err(error) => return Err(error.into()),
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod handler;
pub mod resource;
pub mod types;

mod broker;
mod storage;

pub use audit::AuditService;
pub use broker::{InMemoryBroker, InMemoryBrokerSession};
pub use config::{ConfigError, TriggerConfig};
pub use coordinator::{ScopeState, TransactionCoordinator, TransactionScope};
pub use errors::{
    MessagingError, ResourceKind, StorageError, TransactionError, TransactionResult, TriggerError,
};
pub use handler::{AssignId, Sequential, TriggerHandler};
pub use resource::{
    MessagingResource, MessagingSession, ReceiveWait, StorageInspector, StorageResource,
    StorageSession,
};
pub use storage::{InMemoryStorage, InMemoryStorageSession};
pub use types::{
    AuditEntry, AuditOperation, Message, MessageId, QueueName, Record, RecordId, RecordName,
    ScopeId, Statement, Table, Timestamp,
};
