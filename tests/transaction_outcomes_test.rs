use dualcommit::{
    InMemoryBroker, InMemoryStorage, MessagingError, QueueName, Record, RecordId, RecordName,
    ResourceKind, ScopeState, Statement, StorageError, StorageInspector, Table,
    TransactionCoordinator, TransactionError, TriggerError, TriggerHandler,
};
use dualcommit_testing::{FailureSimulator, FaultyMessaging, FaultyStorage, MessagingFailure};

type Coordinator =
    TransactionCoordinator<FaultyMessaging<InMemoryBroker>, FaultyStorage<InMemoryStorage>>;

struct Fixture {
    broker: InMemoryBroker,
    storage: InMemoryStorage,
    simulator: FailureSimulator,
    coordinator: Coordinator,
    handler: TriggerHandler,
}

fn queue() -> QueueName {
    QueueName::try_new("trigger-queue").expect("valid queue name")
}

fn fixture_with_messages(payloads: &[&str]) -> Fixture {
    let broker = InMemoryBroker::new();
    let storage = InMemoryStorage::new();
    let simulator = FailureSimulator::new();
    for payload in payloads {
        let _ = broker.publish(&queue(), *payload);
    }

    let coordinator = TransactionCoordinator::new(
        FaultyMessaging::new(broker.clone(), simulator.clone()),
        FaultyStorage::new(storage.clone(), simulator.clone()),
    );

    Fixture {
        broker,
        storage,
        simulator,
        coordinator,
        handler: TriggerHandler::new(queue()),
    }
}

async fn stored_rows(storage: &InMemoryStorage) -> Vec<(i64, String)> {
    storage
        .records()
        .await
        .expect("in-memory reads succeed")
        .into_iter()
        .map(|record| (record.id.into_inner(), record.name.to_string()))
        .collect()
}

#[tokio::test]
async fn successful_work_commits_records_and_consumes_messages() {
    // Given: A queue holding two messages and empty storage.
    let fixture = fixture_with_messages(&["foo", "bar"]);

    // When: The handler drains the queue inside a transaction.
    let result = fixture.handler.run_trigger(&fixture.coordinator).await;

    // Then: Both records are visible and both messages are gone.
    assert_eq!(result.unwrap(), 2);
    assert_eq!(
        stored_rows(&fixture.storage).await,
        vec![(0, "foo".to_string()), (1, "bar".to_string())]
    );
    assert_eq!(fixture.broker.depth(&queue()), 0);
    assert_eq!(fixture.coordinator.last_outcome(), Some(ScopeState::Committed));
}

#[tokio::test]
async fn failing_work_leaves_storage_empty_and_queue_unchanged() {
    // Given: Two messages and a unit of work that fails after writing.
    let fixture = fixture_with_messages(&["foo", "bar"]);

    // When: The work receives both messages, writes a record, then fails.
    let result: Result<(), TransactionError<TriggerError>> = fixture
        .coordinator
        .run_in_transaction(async |scope| {
            let _ = scope.try_receive(&queue()).await?;
            let _ = scope.try_receive(&queue()).await?;
            let _ = scope
                .execute(Statement::InsertRecord(Record::new(
                    RecordId::new(0),
                    RecordName::try_new("foo").expect("valid name"),
                )))
                .await?;
            Err(TriggerError::Messaging(MessagingError::Unavailable(
                "downstream gone".to_string(),
            )))
        })
        .await;

    // Then: The original error is returned and nothing is visible.
    assert!(matches!(
        result,
        Err(TransactionError::WorkFailed(TriggerError::Messaging(
            MessagingError::Unavailable(_)
        )))
    ));
    assert!(stored_rows(&fixture.storage).await.is_empty());
    assert_eq!(fixture.broker.pending(&queue()), vec!["foo", "bar"]);
    assert_eq!(fixture.coordinator.last_outcome(), Some(ScopeState::RolledBack));
}

#[tokio::test]
async fn messaging_failure_after_storage_commit_keeps_records_and_drains_queue() {
    // Given: The queue contains ["foo", "bar"] and storage is empty.
    let fixture = fixture_with_messages(&["foo", "bar"]);
    fixture
        .simulator
        .fail_next_messaging_commit(MessagingFailure::AfterAcknowledge);

    // When: The handler drains both messages and the messaging commit fails.
    let result = fixture.handler.run_trigger(&fixture.coordinator).await;

    // Then: Both rows are stored with sequential ids, the queue is drained,
    // and the error is the atomicity violation.
    let error = result.unwrap_err();
    assert!(matches!(
        error,
        TransactionError::MessagingCommitFailedAfterStorageCommit { .. }
    ));
    assert!(error.violates_atomicity());
    assert!(!error.is_retryable());
    assert_eq!(
        stored_rows(&fixture.storage).await,
        vec![(0, "foo".to_string()), (1, "bar".to_string())]
    );
    assert_eq!(fixture.broker.depth(&queue()), 0);
    assert_eq!(
        fixture.coordinator.last_outcome(),
        Some(ScopeState::MessagingCommitFailedAfterStorageCommit)
    );
    assert_eq!(fixture.handler.processed(), 2);
}

#[tokio::test]
async fn storage_commit_failure_keeps_messages_and_writes_nothing() {
    // Given: The queue contains ["foo", "bar"] and storage is empty.
    let fixture = fixture_with_messages(&["foo", "bar"]);
    fixture.simulator.fail_next_storage_commit();

    // When: The handler drains both messages and the storage commit fails.
    let result = fixture.handler.run_trigger(&fixture.coordinator).await;

    // Then: No rows are stored, both messages remain, and the error is
    // the retryable storage failure.
    let error = result.unwrap_err();
    assert!(matches!(error, TransactionError::StorageCommitFailed { .. }));
    assert!(error.is_retryable());
    assert_eq!(fixture.storage.count_rows(Table::Records).await.unwrap(), 0);
    assert_eq!(fixture.broker.pending(&queue()), vec!["foo", "bar"]);
    assert_eq!(fixture.handler.processed(), 0);
}

#[tokio::test]
async fn retry_after_storage_commit_failure_succeeds() {
    // Given: A storage commit failure on the first attempt.
    let fixture = fixture_with_messages(&["foo", "bar"]);
    fixture.simulator.fail_next_storage_commit();
    let first = fixture.handler.run_trigger(&fixture.coordinator).await;

    // When: The caller retries.
    let second = fixture.handler.run_trigger(&fixture.coordinator).await;

    // Then: The redelivered messages are stored exactly once.
    assert!(first.is_err_and(|error| error.is_retryable()));
    assert_eq!(second.unwrap(), 2);
    assert_eq!(
        stored_rows(&fixture.storage).await,
        vec![(0, "foo".to_string()), (1, "bar".to_string())]
    );
    assert_eq!(fixture.broker.depth(&queue()), 0);
}

#[tokio::test]
async fn rejected_messaging_commit_redelivers_and_replay_is_detected() {
    // Given: The broker rejects the next commit, so the messages come back
    // after storage already committed.
    let fixture = fixture_with_messages(&["foo", "bar"]);
    fixture
        .simulator
        .fail_next_messaging_commit(MessagingFailure::Rejected);
    let first = fixture.handler.run_trigger(&fixture.coordinator).await;

    // When: The redelivered messages are handled again.
    let replay = fixture.handler.run_trigger(&fixture.coordinator).await;

    // Then: The first attempt reports the atomicity violation, the replay
    // hits the duplicate key, and the rows are stored only once.
    assert!(first.is_err_and(|error| error.violates_atomicity()));
    assert!(matches!(
        replay,
        Err(TransactionError::WorkFailed(TriggerError::Storage(
            StorageError::DuplicateKey { id, .. }
        ))) if id == RecordId::new(0)
    ));
    assert_eq!(stored_rows(&fixture.storage).await.len(), 2);
    assert_eq!(fixture.broker.pending(&queue()), vec!["foo", "bar"]);
    let deliveries: Vec<u32> = fixture
        .broker
        .peek_all(&queue())
        .iter()
        .map(|message| message.delivery_count)
        .collect();
    assert_eq!(deliveries, vec![2, 1]);
}

#[tokio::test]
async fn messaging_enlistment_failure_touches_nothing() {
    // Given: The broker refuses to open a session.
    let fixture = fixture_with_messages(&["foo"]);
    fixture.simulator.fail_next_messaging_begin();

    // When: A transaction is attempted.
    let result = fixture.handler.run_trigger(&fixture.coordinator).await;

    // Then: Enlistment failure names messaging and nothing changed.
    assert!(matches!(
        result,
        Err(TransactionError::EnlistmentFailed {
            resource: ResourceKind::Messaging,
            ..
        })
    ));
    assert_eq!(fixture.broker.depth(&queue()), 1);
    assert_eq!(fixture.storage.count_rows(Table::Records).await.unwrap(), 0);
}

#[tokio::test]
async fn storage_enlistment_failure_is_retryable() {
    // Given: The database refuses to open a transaction.
    let fixture = fixture_with_messages(&["foo"]);
    fixture.simulator.fail_next_storage_begin();

    // When: A transaction is attempted.
    let result = fixture.handler.run_trigger(&fixture.coordinator).await;

    // Then: Enlistment failure names storage and the message is still queued.
    let error = result.unwrap_err();
    assert!(matches!(
        error,
        TransactionError::EnlistmentFailed {
            resource: ResourceKind::Storage,
            ..
        }
    ));
    assert!(error.is_retryable());
    assert_eq!(fixture.broker.pending(&queue()), vec!["foo"]);
}

#[tokio::test]
async fn enlistment_failure_clears_the_previous_outcome() {
    // Given: A coordinator whose last scope committed.
    let fixture = fixture_with_messages(&["foo"]);
    let _ = fixture.handler.run_trigger(&fixture.coordinator).await.unwrap();
    assert_eq!(fixture.coordinator.last_outcome(), Some(ScopeState::Committed));

    // When: The next transaction cannot enlist storage.
    fixture.simulator.fail_next_storage_begin();
    let result = fixture.handler.run_trigger(&fixture.coordinator).await;

    // Then: No outcome is reported for a scope that never opened.
    assert!(matches!(
        result,
        Err(TransactionError::EnlistmentFailed { .. })
    ));
    assert_eq!(fixture.coordinator.last_outcome(), None);
}

#[tokio::test]
async fn concurrent_scopes_each_take_distinct_messages() {
    // Given: Four messages and two handlers numbering from different bases.
    let fixture = fixture_with_messages(&["a", "b", "c", "d"]);
    let low = TriggerHandler::from_config(
        &dualcommit::TriggerConfig::new("trigger-queue")
            .unwrap()
            .with_first_id(RecordId::new(0)),
    );
    let high = TriggerHandler::from_config(
        &dualcommit::TriggerConfig::new("trigger-queue")
            .unwrap()
            .with_first_id(RecordId::new(100)),
    );

    // When: Both scopes drain the queue at the same time.
    let (first, second) = tokio::join!(
        low.run_trigger(&fixture.coordinator),
        high.run_trigger(&fixture.coordinator)
    );

    // Then: Both scopes handled messages and none was stored twice.
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(first > 0, "low scope handled nothing");
    assert!(second > 0, "high scope handled nothing");
    assert_eq!(first + second, 4);
    let rows = stored_rows(&fixture.storage).await;
    assert!(rows.iter().any(|(id, _)| *id < 100));
    assert!(rows.iter().any(|(id, _)| *id >= 100));
    let mut names: Vec<String> = rows.into_iter().map(|(_, name)| name).collect();
    names.sort();
    assert_eq!(names, vec!["a", "b", "c", "d"]);
    assert_eq!(fixture.broker.depth(&queue()), 0);
}
