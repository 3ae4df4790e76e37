use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::errors::StorageError;
use crate::resource::{StorageInspector, StorageResource, StorageSession};
use crate::types::{AuditEntry, Record, RecordId, Statement, Table};

#[derive(Debug, Clone, Default)]
struct Tables {
    records: BTreeMap<RecordId, Record>,
    audits: Vec<AuditEntry>,
}

impl Tables {
    fn apply(&mut self, statement: &Statement) -> Result<u64, StorageError> {
        match statement {
            Statement::InsertRecord(record) => {
                if self.records.contains_key(&record.id) {
                    return Err(StorageError::DuplicateKey {
                        table: Table::Records,
                        id: record.id,
                    });
                }
                let _ = self.records.insert(record.id, record.clone());
                Ok(1)
            }
            Statement::InsertAudit(entry) => {
                self.audits.push(entry.clone());
                Ok(1)
            }
            Statement::DeleteAll(table) => {
                let deleted = self.count(*table);
                match table {
                    Table::Records => self.records.clear(),
                    Table::Audits => self.audits.clear(),
                }
                Ok(deleted)
            }
        }
    }

    fn count(&self, table: Table) -> u64 {
        match table {
            Table::Records => self.records.len() as u64,
            Table::Audits => self.audits.len() as u64,
        }
    }
}

/// In-memory relational store for development and testing.
///
/// Each session works on a private snapshot taken at `begin`, so its writes
/// are invisible to everyone else until commit. Commit replays the session's
/// statements against the latest committed state and swaps it in atomically;
/// if a replayed statement no longer applies (another session committed the
/// same key first) the commit fails and nothing is written.
///
/// Clones share the same tables.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    committed: Arc<Mutex<Tables>>,
}

impl InMemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> MutexGuard<'_, Tables> {
        self.committed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageResource for InMemoryStorage {
    type Session = InMemoryStorageSession;

    async fn begin(&self) -> Result<Self::Session, StorageError> {
        let snapshot = self
            .committed
            .lock()
            .map_err(|_| StorageError::Unavailable("storage lock poisoned".to_string()))?
            .clone();

        Ok(InMemoryStorageSession {
            committed: Arc::clone(&self.committed),
            snapshot,
            log: Vec::new(),
        })
    }
}

impl StorageInspector for InMemoryStorage {
    async fn count_rows(&self, table: Table) -> Result<u64, StorageError> {
        Ok(self.read().count(table))
    }

    async fn find_record(&self, id: RecordId) -> Result<Option<Record>, StorageError> {
        Ok(self.read().records.get(&id).cloned())
    }

    async fn records(&self) -> Result<Vec<Record>, StorageError> {
        Ok(self.read().records.values().cloned().collect())
    }

    async fn audits(&self) -> Result<Vec<AuditEntry>, StorageError> {
        Ok(self.read().audits.clone())
    }
}

/// A transaction on an [`InMemoryStorage`].
///
/// Dropping the session without committing discards its writes.
pub struct InMemoryStorageSession {
    committed: Arc<Mutex<Tables>>,
    snapshot: Tables,
    log: Vec<Statement>,
}

impl StorageSession for InMemoryStorageSession {
    async fn execute(&mut self, statement: Statement) -> Result<u64, StorageError> {
        let affected = self.snapshot.apply(&statement)?;
        self.log.push(statement);
        Ok(affected)
    }

    async fn count_rows(&mut self, table: Table) -> Result<u64, StorageError> {
        Ok(self.snapshot.count(table))
    }

    async fn commit(self) -> Result<(), StorageError> {
        let mut committed = self
            .committed
            .lock()
            .map_err(|_| StorageError::Unavailable("storage lock poisoned".to_string()))?;

        let mut next = committed.clone();
        for statement in &self.log {
            let _ = next
                .apply(statement)
                .map_err(|error| StorageError::CommitFailed(error.to_string()))?;
        }
        *committed = next;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuditOperation, RecordName, Timestamp};

    fn record(id: i64, name: &str) -> Record {
        Record::new(RecordId::new(id), RecordName::try_new(name).unwrap())
    }

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let storage = InMemoryStorage::new();
        let mut session = storage.begin().await.unwrap();

        let affected = session
            .execute(Statement::InsertRecord(record(0, "foo")))
            .await
            .unwrap();

        assert_eq!(affected, 1);
        assert_eq!(session.count_rows(Table::Records).await.unwrap(), 1);
        assert_eq!(storage.count_rows(Table::Records).await.unwrap(), 0);

        session.commit().await.unwrap();
        assert_eq!(storage.count_rows(Table::Records).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let storage = InMemoryStorage::new();
        let mut session = storage.begin().await.unwrap();
        let _ = session
            .execute(Statement::InsertRecord(record(0, "foo")))
            .await
            .unwrap();

        session.rollback().await.unwrap();

        assert_eq!(storage.count_rows(Table::Records).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dropped_session_discards_writes() {
        let storage = InMemoryStorage::new();
        {
            let mut session = storage.begin().await.unwrap();
            let _ = session
                .execute(Statement::InsertRecord(record(0, "foo")))
                .await
                .unwrap();
        }

        assert!(storage.records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected_at_execute() {
        let storage = InMemoryStorage::new();
        let mut session = storage.begin().await.unwrap();
        let _ = session
            .execute(Statement::InsertRecord(record(0, "foo")))
            .await
            .unwrap();
        session.commit().await.unwrap();

        let mut replay = storage.begin().await.unwrap();
        let result = replay
            .execute(Statement::InsertRecord(record(0, "foo")))
            .await;

        assert_eq!(
            result,
            Err(StorageError::DuplicateKey {
                table: Table::Records,
                id: RecordId::new(0),
            })
        );
    }

    #[tokio::test]
    async fn conflicting_concurrent_commit_fails_without_partial_writes() {
        let storage = InMemoryStorage::new();
        let mut first = storage.begin().await.unwrap();
        let mut second = storage.begin().await.unwrap();

        let _ = first
            .execute(Statement::InsertRecord(record(1, "first")))
            .await
            .unwrap();
        let _ = second
            .execute(Statement::InsertRecord(record(2, "second")))
            .await
            .unwrap();
        let _ = second
            .execute(Statement::InsertRecord(record(1, "clash")))
            .await
            .unwrap();

        first.commit().await.unwrap();
        let result = second.commit().await;

        assert!(matches!(result, Err(StorageError::CommitFailed(_))));
        let names: Vec<String> = storage
            .records()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name.to_string())
            .collect();
        assert_eq!(names, vec!["first"]);
    }

    #[tokio::test]
    async fn delete_all_reports_deleted_rows() {
        let storage = InMemoryStorage::new();
        let mut session = storage.begin().await.unwrap();
        for id in 0..3 {
            let _ = session
                .execute(Statement::InsertRecord(record(id, "row")))
                .await
                .unwrap();
        }
        session.commit().await.unwrap();

        let mut session = storage.begin().await.unwrap();
        let deleted = session
            .execute(Statement::DeleteAll(Table::Records))
            .await
            .unwrap();
        session.commit().await.unwrap();

        assert_eq!(deleted, 3);
        assert_eq!(storage.count_rows(Table::Records).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn records_are_listed_by_id() {
        let storage = InMemoryStorage::new();
        let mut session = storage.begin().await.unwrap();
        let _ = session
            .execute(Statement::InsertRecord(record(5, "five")))
            .await
            .unwrap();
        let _ = session
            .execute(Statement::InsertRecord(record(2, "two")))
            .await
            .unwrap();
        session.commit().await.unwrap();

        let ids: Vec<i64> = storage
            .records()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id.into_inner())
            .collect();
        assert_eq!(ids, vec![2, 5]);
        assert!(storage.find_record(RecordId::new(5)).await.unwrap().is_some());
        assert!(storage.find_record(RecordId::new(3)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn audits_keep_insertion_order() {
        let storage = InMemoryStorage::new();
        let mut session = storage.begin().await.unwrap();
        for name in ["a", "b"] {
            let entry = AuditEntry {
                id: RecordId::new(1),
                operation: AuditOperation::try_new("INSERT").unwrap(),
                name: name.to_string(),
                audited_at: Timestamp::now(),
            };
            let _ = session.execute(Statement::InsertAudit(entry)).await.unwrap();
        }
        session.commit().await.unwrap();

        let names: Vec<String> = storage
            .audits()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
