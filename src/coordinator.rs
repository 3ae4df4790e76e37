//! The dual-resource transaction coordinator.
//!
//! A [`TransactionCoordinator`] owns one messaging resource and one storage
//! resource. For every unit of work it opens a [`TransactionScope`] that
//! holds an exclusive session on each, lets the work receive, send and write
//! through that scope, and then completes both sessions with a fixed
//! sequence:
//!
//! ```text
//! Open ──work ok──▶ CommittingStorage ──ok──▶ StorageCommitted ──▶ CommittingMessaging ──ok──▶ Committed
//!   │                      │                                              │
//!   │ work err             │ err                                          │ err
//!   ▼                      ▼                                              ▼
//! RolledBack        StorageCommitFailed            MessagingCommitFailedAfterStorageCommit
//! ```
//!
//! Storage always commits before messaging. If the storage commit fails the
//! messaging session is rolled back and its messages are redelivered. If
//! messaging fails after storage committed, the storage writes are already
//! durable; the coordinator reports this as
//! [`TransactionError::MessagingCommitFailedAfterStorageCommit`] so that the
//! inconsistency is visible. Committing in the other order would only swap
//! which side is left inconsistent, and a lost message is harder to detect
//! than a duplicated write.

use std::ops::AsyncFnOnce;
use std::sync::{Mutex, PoisonError};

use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::errors::{
    MessagingError, ResourceKind, StorageError, TransactionError, TransactionResult,
};
use crate::resource::{
    MessagingResource, MessagingSession, ReceiveWait, StorageResource, StorageSession,
};
use crate::types::{Message, QueueName, ScopeId, Statement, Table};

/// Lifecycle state of a transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeState {
    /// Work may receive, send and write.
    Open,
    /// The storage session is committing.
    CommittingStorage,
    /// Storage is durable; messaging has not committed yet.
    StorageCommitted,
    /// The messaging session is committing.
    CommittingMessaging,
    /// Both resources committed.
    Committed,
    /// Both resources were rolled back after the work failed.
    RolledBack,
    /// Storage refused to commit; messaging was rolled back.
    StorageCommitFailed,
    /// Storage committed, messaging did not.
    MessagingCommitFailedAfterStorageCommit,
}

impl ScopeState {
    /// Whether a scope in this state may move to `next`.
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::CommittingStorage | Self::RolledBack)
                | (
                    Self::CommittingStorage,
                    Self::StorageCommitted | Self::StorageCommitFailed
                )
                | (Self::StorageCommitted, Self::CommittingMessaging)
                | (
                    Self::CommittingMessaging,
                    Self::Committed | Self::MessagingCommitFailedAfterStorageCommit
                )
        )
    }

    /// Whether the scope can no longer change state.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed
                | Self::RolledBack
                | Self::StorageCommitFailed
                | Self::MessagingCommitFailedAfterStorageCommit
        )
    }
}

/// One logical transaction spanning a messaging session and a storage
/// session.
///
/// The scope is handed to the unit of work by mutable reference; the work
/// reaches both resources only through it.
pub struct TransactionScope<M, S> {
    lifecycle: Lifecycle,
    messaging: M,
    storage: S,
    received: usize,
    executed: usize,
}

/// Identity and state of a scope, kept apart from the sessions so that it
/// outlives them while they are committed or rolled back by value.
#[derive(Debug, Clone, Copy)]
struct Lifecycle {
    id: ScopeId,
    state: ScopeState,
}

impl Lifecycle {
    fn advance(&mut self, next: ScopeState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal scope transition {:?} -> {next:?}",
            self.state
        );
        debug!(from = ?self.state, to = ?next, "scope state changed");
        self.state = next;
    }
}

impl<M, S> TransactionScope<M, S>
where
    M: MessagingSession,
    S: StorageSession,
{
    fn new(id: ScopeId, messaging: M, storage: S) -> Self {
        Self {
            lifecycle: Lifecycle {
                id,
                state: ScopeState::Open,
            },
            messaging,
            storage,
            received: 0,
            executed: 0,
        }
    }

    /// Identifier of this scope.
    pub const fn id(&self) -> ScopeId {
        self.lifecycle.id
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> ScopeState {
        self.lifecycle.state
    }

    /// Number of messages received through this scope.
    pub const fn messages_received(&self) -> usize {
        self.received
    }

    /// Number of statements executed through this scope.
    pub const fn statements_executed(&self) -> usize {
        self.executed
    }

    /// Receive the next message from `queue`, waiting as `wait` allows.
    pub async fn receive(
        &mut self,
        queue: &QueueName,
        wait: ReceiveWait,
    ) -> Result<Option<Message>, MessagingError> {
        let message = self.messaging.receive(queue, wait).await?;
        if message.is_some() {
            self.received += 1;
        }
        Ok(message)
    }

    /// Receive the next message from `queue` without waiting.
    pub async fn try_receive(&mut self, queue: &QueueName) -> Result<Option<Message>, MessagingError> {
        self.receive(queue, ReceiveWait::Immediate).await
    }

    /// Send `payload` to `queue` once the scope commits.
    pub async fn send(
        &mut self,
        queue: &QueueName,
        payload: impl Into<String>,
    ) -> Result<(), MessagingError> {
        self.messaging.send(queue, payload.into()).await
    }

    /// Execute `statement` in the scope's storage transaction.
    pub async fn execute(&mut self, statement: Statement) -> Result<u64, StorageError> {
        let affected = self.storage.execute(statement).await?;
        self.executed += 1;
        Ok(affected)
    }

    /// Count rows of `table` as seen from inside the scope.
    pub async fn count_rows(&mut self, table: Table) -> Result<u64, StorageError> {
        self.storage.count_rows(table).await
    }

    async fn commit<E>(self) -> (ScopeState, TransactionResult<(), E>) {
        let Self {
            mut lifecycle,
            messaging,
            storage,
            ..
        } = self;

        lifecycle.advance(ScopeState::CommittingStorage);
        if let Err(source) = storage.commit().await {
            lifecycle.advance(ScopeState::StorageCommitFailed);
            warn!(error = %source, "storage commit failed, rolling back messaging");
            if let Err(rollback_error) = messaging.rollback().await {
                error!(error = %rollback_error, "messaging rollback failed");
            }
            return (
                lifecycle.state,
                Err(TransactionError::StorageCommitFailed {
                    scope: lifecycle.id,
                    source,
                }),
            );
        }
        lifecycle.advance(ScopeState::StorageCommitted);

        lifecycle.advance(ScopeState::CommittingMessaging);
        if let Err(source) = messaging.commit().await {
            lifecycle.advance(ScopeState::MessagingCommitFailedAfterStorageCommit);
            error!(
                error = %source,
                "messaging commit failed after storage commit; storage writes remain visible"
            );
            return (
                lifecycle.state,
                Err(TransactionError::MessagingCommitFailedAfterStorageCommit {
                    scope: lifecycle.id,
                    source,
                }),
            );
        }
        lifecycle.advance(ScopeState::Committed);

        (lifecycle.state, Ok(()))
    }

    async fn rollback(self) -> ScopeState {
        let Self {
            mut lifecycle,
            messaging,
            storage,
            ..
        } = self;

        lifecycle.advance(ScopeState::RolledBack);
        if let Err(error) = storage.rollback().await {
            error!(error = %error, "storage rollback failed");
        }
        if let Err(error) = messaging.rollback().await {
            error!(error = %error, "messaging rollback failed");
        }
        lifecycle.state
    }
}

/// Runs units of work against a messaging resource and a storage resource
/// with all-or-nothing intent.
///
/// # Example
///
/// ```rust,ignore
/// let coordinator = TransactionCoordinator::new(broker, storage);
/// let written = coordinator
///     .run_in_transaction(async |scope| handler.handle(scope).await)
///     .await?;
/// ```
pub struct TransactionCoordinator<M, S> {
    messaging: M,
    storage: S,
    last_outcome: Mutex<Option<ScopeState>>,
}

impl<M, S> TransactionCoordinator<M, S>
where
    M: MessagingResource,
    S: StorageResource,
{
    /// Create a coordinator over the two resources.
    pub const fn new(messaging: M, storage: S) -> Self {
        Self {
            messaging,
            storage,
            last_outcome: Mutex::new(None),
        }
    }

    /// The messaging resource.
    pub const fn messaging(&self) -> &M {
        &self.messaging
    }

    /// The storage resource.
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    /// Terminal state of the most recently completed scope.
    ///
    /// A failed enlistment clears it: no scope was opened, so there is no
    /// outcome to report.
    pub fn last_outcome(&self) -> Option<ScopeState> {
        *self
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record_outcome(&self, state: Option<ScopeState>) {
        *self
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Open a scope, enlisting a fresh session on each resource.
    ///
    /// The caller must hand the scope back to [`commit`](Self::commit) or
    /// [`rollback`](Self::rollback); a scope that is simply dropped rolls
    /// both sessions back.
    pub async fn begin<E>(&self) -> TransactionResult<TransactionScope<M::Session, S::Session>, E> {
        self.enlist(ScopeId::new()).await
    }

    async fn enlist<E>(
        &self,
        id: ScopeId,
    ) -> TransactionResult<TransactionScope<M::Session, S::Session>, E> {
        let result = self.open_sessions(id).await;
        if result.is_err() {
            self.record_outcome(None);
        }
        result
    }

    async fn open_sessions<E>(
        &self,
        id: ScopeId,
    ) -> TransactionResult<TransactionScope<M::Session, S::Session>, E> {
        let messaging = self.messaging.begin().await.map_err(|error| {
            warn!(error = %error, "messaging enlistment failed");
            TransactionError::EnlistmentFailed {
                resource: ResourceKind::Messaging,
                reason: error.to_string(),
            }
        })?;

        let storage = match self.storage.begin().await {
            Ok(storage) => storage,
            Err(error) => {
                warn!(error = %error, "storage enlistment failed");
                if let Err(rollback_error) = messaging.rollback().await {
                    error!(error = %rollback_error, "messaging rollback failed");
                }
                return Err(TransactionError::EnlistmentFailed {
                    resource: ResourceKind::Storage,
                    reason: error.to_string(),
                });
            }
        };

        debug!(scope = %id, "enlisted messaging and storage sessions");
        Ok(TransactionScope::new(id, messaging, storage))
    }

    /// Commit `scope`: storage first, then messaging.
    pub async fn commit<E>(
        &self,
        scope: TransactionScope<M::Session, S::Session>,
    ) -> TransactionResult<(), E> {
        let received = scope.messages_received();
        let executed = scope.statements_executed();
        let (state, result) = scope.commit().await;
        self.record_outcome(Some(state));
        if result.is_ok() {
            info!(received, executed, "transaction committed");
        }
        result
    }

    /// Roll both sessions of `scope` back.
    pub async fn rollback(&self, scope: TransactionScope<M::Session, S::Session>) {
        let state = scope.rollback().await;
        self.record_outcome(Some(state));
    }

    /// Run `work` inside a new scope and complete the scope according to its
    /// result.
    ///
    /// - `work` fails: both sessions roll back and the error is returned
    ///   unchanged inside [`TransactionError::WorkFailed`].
    /// - storage commit fails: messaging rolls back,
    ///   [`TransactionError::StorageCommitFailed`].
    /// - messaging commit fails after storage committed:
    ///   [`TransactionError::MessagingCommitFailedAfterStorageCommit`].
    /// - both commit: `work`'s value is returned.
    pub async fn run_in_transaction<T, E, F>(&self, work: F) -> TransactionResult<T, E>
    where
        F: AsyncFnOnce(&mut TransactionScope<M::Session, S::Session>) -> Result<T, E>,
    {
        let id = ScopeId::new();
        let span = info_span!("transaction", scope = %id);

        async move {
            let mut scope = self.enlist(id).await?;

            match work(&mut scope).await {
                Ok(value) => {
                    self.commit(scope).await?;
                    Ok(value)
                }
                Err(error) => {
                    warn!(
                        received = scope.messages_received(),
                        executed = scope.statements_executed(),
                        "unit of work failed, rolling back both resources"
                    );
                    self.rollback(scope).await;
                    Err(TransactionError::WorkFailed(error))
                }
            }
        }
        .instrument(span)
        .await
    }
}
