//! Audit trail writes that commit on their own.
//!
//! An audit entry outlives the business transaction that produced it: the
//! [`AuditService`] opens a separate storage session for every entry.

use tracing::{debug, instrument};

use crate::errors::StorageError;
use crate::resource::{StorageResource, StorageSession};
use crate::types::{AuditEntry, AuditOperation, RecordId, Statement, Timestamp};

/// Writes audit trail rows in their own storage transaction.
///
/// An audit row is committed as soon as [`record`](Self::record) returns,
/// regardless of what happens to any transaction scope that is open at the
/// time. Audit rows therefore survive the rollback of the business work
/// they describe.
#[derive(Debug, Clone)]
pub struct AuditService<S> {
    storage: S,
}

impl<S: StorageResource> AuditService<S> {
    /// Audit service writing to `storage`.
    pub const fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Insert and commit one audit row stamped with the current time.
    #[instrument(name = "audit.record", skip(self, name))]
    pub async fn record(
        &self,
        id: RecordId,
        operation: AuditOperation,
        name: impl Into<String>,
    ) -> Result<AuditEntry, StorageError> {
        let entry = AuditEntry {
            id,
            operation,
            name: name.into(),
            audited_at: Timestamp::now(),
        };

        let mut session = self.storage.begin().await?;
        let _ = session.execute(Statement::InsertAudit(entry.clone())).await?;
        session.commit().await?;

        debug!("audit entry committed");
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::StorageInspector;
    use crate::storage::InMemoryStorage;
    use crate::types::{Record, RecordName, Table};

    fn insert() -> AuditOperation {
        AuditOperation::try_new("INSERT").unwrap()
    }

    #[tokio::test]
    async fn record_commits_immediately() {
        let storage = InMemoryStorage::new();
        let audit = AuditService::new(storage.clone());

        let entry = audit.record(RecordId::new(1), insert(), "foo").await.unwrap();

        assert_eq!(storage.audits().await.unwrap(), vec![entry]);
    }

    #[tokio::test]
    async fn audit_survives_rollback_of_an_open_session() {
        let storage = InMemoryStorage::new();
        let audit = AuditService::new(storage.clone());

        let mut business = storage.begin().await.unwrap();
        let _ = business
            .execute(Statement::InsertRecord(Record::new(
                RecordId::new(1),
                RecordName::try_new("foo").unwrap(),
            )))
            .await
            .unwrap();
        let _ = audit.record(RecordId::new(1), insert(), "foo").await.unwrap();
        business.rollback().await.unwrap();

        assert_eq!(storage.count_rows(Table::Records).await.unwrap(), 0);
        assert_eq!(storage.count_rows(Table::Audits).await.unwrap(), 1);
    }
}
