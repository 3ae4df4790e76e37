//! Error types for `dualcommit`.
//!
//! Each layer owns its error enum:
//!
//! - **MessagingError**: failures reported by the messaging resource
//! - **StorageError**: failures reported by the storage resource
//! - **TriggerError**: failures raised by the trigger handler while it works
//! - **TransactionError**: the outcome classification of one transaction scope
//!
//! `TransactionError` is the one callers match on. Its three commit-related
//! variants are deliberately distinct so that monitoring can tell a safe,
//! retryable failure apart from a real atomicity violation:
//!
//! ```rust,ignore
//! match coordinator.run_in_transaction(work).await {
//!     Ok(count) => info!(count, "processed"),
//!     Err(error) if error.violates_atomicity() => alert(&error),
//!     Err(error) if error.is_retryable() => schedule_retry(),
//!     Err(error) => return Err(error),
//! }
//! ```

use crate::types::{MessageId, RecordId, ScopeId, Table};
use thiserror::Error;

/// Which of the two enlisted resources an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// The message broker.
    Messaging,
    /// The relational store.
    Storage,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Messaging => f.write_str("messaging"),
            Self::Storage => f.write_str("storage"),
        }
    }
}

/// Errors raised by a messaging resource or one of its sessions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessagingError {
    /// The broker could not be reached or its state is unusable.
    #[error("messaging resource unavailable: {0}")]
    Unavailable(String),

    /// The broker refused to commit the session.
    #[error("messaging commit failed: {0}")]
    CommitFailed(String),

    /// The broker could not roll the session back.
    #[error("messaging rollback failed: {0}")]
    RollbackFailed(String),
}

/// Errors raised by a storage resource or one of its sessions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// A row with this primary key already exists.
    ///
    /// Replayed messages surface here when ids are assigned deterministically.
    #[error("duplicate key {id} in table '{table}'")]
    DuplicateKey {
        /// Table that rejected the insert
        table: Table,
        /// Conflicting primary key
        id: RecordId,
    },

    /// The database could not be reached or its state is unusable.
    #[error("storage resource unavailable: {0}")]
    Unavailable(String),

    /// The database refused to commit the session.
    #[error("storage commit failed: {0}")]
    CommitFailed(String),

    /// The database could not roll the session back.
    #[error("storage rollback failed: {0}")]
    RollbackFailed(String),

    /// Any other backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors raised by the trigger handler.
///
/// Any of these aborts the handler; the coordinator then rolls back both
/// resources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    /// Receiving from the queue failed.
    #[error("receive failed: {0}")]
    Messaging(#[from] MessagingError),

    /// Writing the record failed.
    #[error("write failed: {0}")]
    Storage(#[from] StorageError),

    /// The payload cannot be stored as a record name.
    #[error("message {message} has an invalid payload: {reason}")]
    InvalidPayload {
        /// Offending message
        message: MessageId,
        /// Why the payload was rejected
        reason: String,
    },
}

/// Outcome classification for a failed transaction scope.
///
/// `E` is the error type of the unit of work; it is carried unchanged in
/// [`TransactionError::WorkFailed`].
#[derive(Debug, Error)]
pub enum TransactionError<E> {
    /// One of the resources could not open a session for the scope.
    ///
    /// Nothing was received or written. Safe to retry.
    #[error("failed to enlist {resource} resource: {reason}")]
    EnlistmentFailed {
        /// Resource that refused the session
        resource: ResourceKind,
        /// Reason reported by the resource
        reason: String,
    },

    /// The unit of work failed before any commit was attempted.
    ///
    /// Both resources were rolled back; received messages will be
    /// redelivered.
    #[error("unit of work failed: {0}")]
    WorkFailed(#[source] E),

    /// The storage resource rejected the commit.
    ///
    /// The messaging resource was rolled back, so received messages will be
    /// redelivered and no record is visible. Safe to retry.
    #[error("storage commit failed in scope {scope}")]
    StorageCommitFailed {
        /// Scope that failed
        scope: ScopeId,
        /// Error reported by the storage resource
        source: StorageError,
    },

    /// Storage committed but the messaging resource then failed to commit.
    ///
    /// The records written by the scope are durable and cannot be retracted.
    /// Retrying the unit of work without deduplication writes them twice.
    #[error("messaging commit failed after storage commit in scope {scope}")]
    MessagingCommitFailedAfterStorageCommit {
        /// Scope that failed
        scope: ScopeId,
        /// Error reported by the messaging resource
        source: MessagingError,
    },
}

impl<E> TransactionError<E> {
    /// Whether re-running the same unit of work is safe.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EnlistmentFailed { .. } | Self::StorageCommitFailed { .. }
        )
    }

    /// True when the two resources ended up disagreeing on the outcome.
    pub const fn violates_atomicity(&self) -> bool {
        matches!(self, Self::MessagingCommitFailedAfterStorageCommit { .. })
    }

    /// Returns the unit of work's own error, if that is what failed.
    pub fn into_work_error(self) -> Option<E> {
        match self {
            Self::WorkFailed(error) => Some(error),
            _ => None,
        }
    }
}

/// Type alias for results of a transaction scope.
pub type TransactionResult<T, E> = Result<T, TransactionError<E>>;
