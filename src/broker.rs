use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::errors::MessagingError;
use crate::resource::{MessagingResource, MessagingSession, ReceiveWait};
use crate::types::{Message, MessageId, QueueName};

type Queues = HashMap<QueueName, VecDeque<Message>>;

/// In-memory message broker for development and testing.
///
/// `InMemoryBroker` behaves like a transacted point-to-point broker: each
/// message is handed to exactly one session, stays invisible to everyone
/// else while that session is open, and returns to the head of its queue if
/// the session rolls back or is dropped.
///
/// Clones share the same queues.
///
/// # Performance Characteristics
///
/// - **Memory-bound**: every pending message is held in memory
/// - **Lock contention**: one `std::sync::Mutex` guards all queues
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<Queues>,
    arrivals: Notify,
}

impl BrokerState {
    fn lock(&self) -> Result<MutexGuard<'_, Queues>, MessagingError> {
        self.queues
            .lock()
            .map_err(|_| MessagingError::Unavailable("broker state lock poisoned".to_string()))
    }

    // Inspection and restore paths must not fail, so they read through poison.
    fn lock_lenient(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InMemoryBroker {
    /// Create a broker with no queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `payload` to `queue` outside of any transaction.
    pub fn publish(&self, queue: &QueueName, payload: impl Into<String>) -> MessageId {
        let message = Message::new(queue.clone(), payload);
        let id = message.id;
        self.state
            .lock_lenient()
            .entry(queue.clone())
            .or_default()
            .push_back(message);
        self.state.arrivals.notify_waiters();
        id
    }

    /// Number of messages available on `queue`.
    pub fn depth(&self, queue: &QueueName) -> usize {
        self.state
            .lock_lenient()
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Payloads available on `queue`, head first.
    pub fn pending(&self, queue: &QueueName) -> Vec<String> {
        self.state
            .lock_lenient()
            .get(queue)
            .map(|messages| messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages available on `queue`, head first.
    pub fn peek_all(&self, queue: &QueueName) -> Vec<Message> {
        self.state
            .lock_lenient()
            .get(queue)
            .map(|messages| messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every available message on `queue` and return how many there were.
    pub fn purge(&self, queue: &QueueName) -> usize {
        self.state
            .lock_lenient()
            .remove(queue)
            .map_or(0, |messages| messages.len())
    }
}

impl MessagingResource for InMemoryBroker {
    type Session = InMemoryBrokerSession;

    async fn begin(&self) -> Result<Self::Session, MessagingError> {
        Ok(InMemoryBrokerSession {
            state: Arc::clone(&self.state),
            received: Vec::new(),
            outgoing: Vec::new(),
            completed: false,
        })
    }
}

/// A transacted session on an [`InMemoryBroker`].
pub struct InMemoryBrokerSession {
    state: Arc<BrokerState>,
    received: Vec<Message>,
    outgoing: Vec<Message>,
    completed: bool,
}

impl InMemoryBrokerSession {
    fn take_next(&mut self, queue: &QueueName) -> Result<Option<Message>, MessagingError> {
        let mut queues = self.state.lock()?;
        let Some(mut message) = queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        drop(queues);

        message.delivery_count += 1;
        self.received.push(message.clone());
        Ok(Some(message))
    }

    /// Put received messages back at the head of their queues, original order.
    fn restore(&mut self) {
        self.outgoing.clear();
        let received = std::mem::take(&mut self.received);
        if received.is_empty() {
            return;
        }

        let mut queues = self.state.lock_lenient();
        for message in received.into_iter().rev() {
            queues
                .entry(message.queue.clone())
                .or_default()
                .push_front(message);
        }
        drop(queues);
        self.state.arrivals.notify_waiters();
    }
}

impl MessagingSession for InMemoryBrokerSession {
    async fn receive(
        &mut self,
        queue: &QueueName,
        wait: ReceiveWait,
    ) -> Result<Option<Message>, MessagingError> {
        // Each delivery is a round-trip on a real broker; other scopes get to run in between.
        tokio::task::yield_now().await;

        let deadline = match wait {
            ReceiveWait::Immediate => None,
            ReceiveWait::Within(duration) => Some(Instant::now() + duration),
        };

        let state = Arc::clone(&self.state);
        loop {
            // Register interest before looking so a concurrent publish is not missed.
            let arrival = state.arrivals.notified();
            tokio::pin!(arrival);
            let _ = arrival.as_mut().enable();

            if let Some(message) = self.take_next(queue)? {
                return Ok(Some(message));
            }

            let Some(deadline) = deadline else {
                return Ok(None);
            };

            if tokio::time::timeout_at(deadline, arrival).await.is_err() {
                return self.take_next(queue);
            }
        }
    }

    async fn send(&mut self, queue: &QueueName, payload: String) -> Result<(), MessagingError> {
        self.outgoing.push(Message::new(queue.clone(), payload));
        Ok(())
    }

    async fn commit(mut self) -> Result<(), MessagingError> {
        let outgoing = std::mem::take(&mut self.outgoing);
        let published = !outgoing.is_empty();

        {
            let mut queues = self.state.lock()?;
            for message in outgoing {
                queues
                    .entry(message.queue.clone())
                    .or_default()
                    .push_back(message);
            }
        }

        self.received.clear();
        self.completed = true;
        if published {
            self.state.arrivals.notify_waiters();
        }
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), MessagingError> {
        self.restore();
        self.completed = true;
        Ok(())
    }
}

impl Drop for InMemoryBrokerSession {
    fn drop(&mut self) {
        if !self.completed {
            self.restore();
        }
    }
}
