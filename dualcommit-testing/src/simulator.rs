//! One-shot failure switches shared by the faulty resource wrappers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::chaos::{Chaos, ChaosConfig};

/// How a simulated messaging commit failure behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessagingFailure {
    /// The broker applied the commit but the reply was lost. The received
    /// messages are gone from the queue; the caller still sees an error.
    AfterAcknowledge,
    /// The broker refused the commit and rolled the session back. The
    /// received messages are redelivered.
    Rejected,
}

#[derive(Debug, Default)]
struct Switches {
    messaging_begin: AtomicBool,
    storage_begin: AtomicBool,
    storage_commit: AtomicBool,
    storage_rollback: AtomicBool,
    messaging_rollback: AtomicBool,
    messaging_commit: Mutex<Option<MessagingFailure>>,
    chaos: Mutex<Option<Arc<Chaos>>>,
}

/// Shared switchboard consulted by [`FaultyMessaging`] and [`FaultyStorage`].
///
/// Every `fail_next_*` switch is one-shot: it fires on the next matching
/// operation and then resets. When no switch is armed, an installed
/// [`ChaosConfig`] decides at random. Clones share the same switches.
///
/// [`FaultyMessaging`]: crate::FaultyMessaging
/// [`FaultyStorage`]: crate::FaultyStorage
#[derive(Debug, Clone, Default)]
pub struct FailureSimulator {
    switches: Arc<Switches>,
}

impl FailureSimulator {
    /// A simulator with nothing armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// A simulator that injects commit failures at random.
    pub fn with_chaos(config: ChaosConfig) -> Self {
        let simulator = Self::new();
        simulator.set_chaos(Some(config));
        simulator
    }

    /// Install or remove random failure injection.
    pub fn set_chaos(&self, config: Option<ChaosConfig>) {
        *self
            .switches
            .chaos
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = config.map(|config| Arc::new(Chaos::new(config)));
    }

    /// Fail the next messaging `begin`.
    pub fn fail_next_messaging_begin(&self) {
        self.switches.messaging_begin.store(true, Ordering::SeqCst);
    }

    /// Fail the next storage `begin`.
    pub fn fail_next_storage_begin(&self) {
        self.switches.storage_begin.store(true, Ordering::SeqCst);
    }

    /// Fail the next storage commit; the session's writes are discarded.
    pub fn fail_next_storage_commit(&self) {
        self.switches.storage_commit.store(true, Ordering::SeqCst);
    }

    /// Fail the next storage rollback. The session is abandoned rather than
    /// rolled back; its writes are never applied.
    pub fn fail_next_storage_rollback(&self) {
        self.switches.storage_rollback.store(true, Ordering::SeqCst);
    }

    /// Fail the next messaging rollback. The session is abandoned rather
    /// than rolled back, so its messages return with the broker's redelivery.
    pub fn fail_next_messaging_rollback(&self) {
        self.switches.messaging_rollback.store(true, Ordering::SeqCst);
    }

    /// Fail the next messaging commit in the given way.
    pub fn fail_next_messaging_commit(&self, failure: MessagingFailure) {
        *self
            .switches
            .messaging_commit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(failure);
    }

    /// Disarm every switch and remove chaos.
    pub fn reset(&self) {
        self.switches.messaging_begin.store(false, Ordering::SeqCst);
        self.switches.storage_begin.store(false, Ordering::SeqCst);
        self.switches.storage_commit.store(false, Ordering::SeqCst);
        self.switches.storage_rollback.store(false, Ordering::SeqCst);
        self.switches.messaging_rollback.store(false, Ordering::SeqCst);
        *self
            .switches
            .messaging_commit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.set_chaos(None);
    }

    fn chaos(&self) -> Option<Arc<Chaos>> {
        self.switches
            .chaos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn take_messaging_begin(&self) -> bool {
        self.switches.messaging_begin.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take_storage_begin(&self) -> bool {
        self.switches.storage_begin.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take_storage_commit(&self) -> bool {
        self.switches.storage_commit.swap(false, Ordering::SeqCst)
            || self.chaos().is_some_and(|chaos| chaos.storage_commit_fails())
    }

    pub(crate) fn take_storage_rollback(&self) -> bool {
        self.switches.storage_rollback.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take_messaging_rollback(&self) -> bool {
        self.switches.messaging_rollback.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take_messaging_commit(&self) -> Option<MessagingFailure> {
        let armed = self
            .switches
            .messaging_commit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        armed.or_else(|| self.chaos().and_then(|chaos| chaos.messaging_commit_failure()))
    }
}
