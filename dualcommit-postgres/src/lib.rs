//! PostgreSQL storage resource for `dualcommit`.
//!
//! Each scope gets its own `sqlx` transaction checked out of a shared pool.
//! Dropping a [`PostgresSession`] without committing rolls the transaction
//! back.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dualcommit::{
    AuditEntry, AuditOperation, Record, RecordId, RecordName, Statement, StorageError,
    StorageInspector, StorageResource, StorageSession, Table, Timestamp,
};
use nutype::nutype;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row, Transaction, query};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

/// Errors raised while setting up a [`PostgresStorage`].
#[derive(Debug, Error)]
pub enum PostgresStorageError {
    /// The pool could not connect.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// The schema migrations failed.
    #[error("failed to apply postgres migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),

    /// A round trip to the server failed.
    #[error("postgres ping failed")]
    PingFailed(#[source] sqlx::Error),
}

/// Maximum number of database connections in the pool.
///
/// MaxConnections represents the connection pool size limit. It must be at least 1,
/// enforced by using NonZeroU32 as the underlying type.
///
/// # Examples
///
/// ```ignore
/// use dualcommit_postgres::MaxConnections;
/// use std::num::NonZeroU32;
///
/// let small_pool = MaxConnections::new(NonZeroU32::new(5).expect("5 is non-zero"));
/// ```
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Configuration for the PostgresStorage connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    BeginTransaction,
    Execute,
    CountRows,
    CommitTransaction,
    RollbackTransaction,
    Inspect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BeginTransaction => "begin_transaction",
            Self::Execute => "execute",
            Self::CountRows => "count_rows",
            Self::CommitTransaction => "commit_transaction",
            Self::RollbackTransaction => "rollback_transaction",
            Self::Inspect => "inspect",
        };
        f.write_str(name)
    }
}

fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> StorageError {
    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );

    let detail = error.to_string();
    match operation {
        Operation::BeginTransaction => StorageError::Unavailable(detail),
        Operation::CommitTransaction => StorageError::CommitFailed(detail),
        Operation::RollbackTransaction => StorageError::RollbackFailed(detail),
        Operation::Execute | Operation::CountRows | Operation::Inspect => {
            StorageError::Backend(format!("{operation}: {detail}"))
        }
    }
}

// 23505: unique constraint violation
fn map_insert_error(error: sqlx::Error, table: Table, id: RecordId) -> StorageError {
    if let sqlx::Error::Database(db_error) = &error {
        if db_error.code().as_deref() == Some("23505") {
            warn!(
                error = %db_error,
                table = %table,
                id = %id,
                "[postgres.duplicate_key] insert rejected"
            );
            return StorageError::DuplicateKey { table, id };
        }
    }
    map_sqlx_error(error, Operation::Execute)
}

const fn count_query(table: Table) -> &'static str {
    match table {
        Table::Records => "SELECT COUNT(*) FROM t_records",
        Table::Audits => "SELECT COUNT(*) FROM t_audits",
    }
}

const fn delete_query(table: Table) -> &'static str {
    match table {
        Table::Records => "DELETE FROM t_records",
        Table::Audits => "DELETE FROM t_audits",
    }
}

fn row_count(row: &PgRow) -> Result<u64, StorageError> {
    let count: i64 = row
        .try_get(0)
        .map_err(|error| map_sqlx_error(error, Operation::CountRows))?;
    u64::try_from(count).map_err(|error| StorageError::Backend(error.to_string()))
}

fn record_from_row(row: &PgRow) -> Result<Record, StorageError> {
    let id: i64 = row
        .try_get("id")
        .map_err(|error| map_sqlx_error(error, Operation::Inspect))?;
    let name: String = row
        .try_get("name")
        .map_err(|error| map_sqlx_error(error, Operation::Inspect))?;
    let created_at: DateTime<Utc> = row
        .try_get("created_at")
        .map_err(|error| map_sqlx_error(error, Operation::Inspect))?;

    Ok(Record {
        id: RecordId::new(id),
        name: RecordName::try_new(name)
            .map_err(|error| StorageError::Backend(format!("stored record {id}: {error}")))?,
        created_at: Timestamp::new(created_at),
    })
}

fn audit_from_row(row: &PgRow) -> Result<AuditEntry, StorageError> {
    let id: i64 = row
        .try_get("id")
        .map_err(|error| map_sqlx_error(error, Operation::Inspect))?;
    let operation: String = row
        .try_get("operation")
        .map_err(|error| map_sqlx_error(error, Operation::Inspect))?;
    let name: String = row
        .try_get("name")
        .map_err(|error| map_sqlx_error(error, Operation::Inspect))?;
    let audit_date: DateTime<Utc> = row
        .try_get("audit_date")
        .map_err(|error| map_sqlx_error(error, Operation::Inspect))?;

    Ok(AuditEntry {
        id: RecordId::new(id),
        operation: AuditOperation::try_new(operation)
            .map_err(|error| StorageError::Backend(format!("stored audit {id}: {error}")))?,
        name,
        audited_at: Timestamp::new(audit_date),
    })
}

/// Storage resource backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: Pool<Postgres>,
}

impl PostgresStorage {
    /// Create a new PostgresStorage with default configuration.
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresStorageError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Create a new PostgresStorage with custom configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresStorageError> {
        let connection_string = connection_string.into();
        let max_connections: std::num::NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresStorageError::ConnectionFailed)?;
        Ok(Self { pool })
    }

    /// Create a PostgresStorage from an existing connection pool.
    ///
    /// Use this when you need full control over pool configuration or want to
    /// share a pool across multiple components.
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Check that the database answers.
    pub async fn ping(&self) -> Result<(), PostgresStorageError> {
        let _ = query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(PostgresStorageError::PingFailed)?;
        Ok(())
    }

    /// Create `t_records` and `t_audits` if they do not exist.
    pub async fn migrate(&self) -> Result<(), PostgresStorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresStorageError::MigrationFailed)
    }
}

impl StorageResource for PostgresStorage {
    type Session = PostgresSession;

    #[instrument(name = "postgres.begin", skip(self))]
    async fn begin(&self) -> Result<Self::Session, StorageError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;
        Ok(PostgresSession { tx })
    }
}

impl StorageInspector for PostgresStorage {
    #[instrument(name = "postgres.count_rows", skip(self))]
    async fn count_rows(&self, table: Table) -> Result<u64, StorageError> {
        let row = query(count_query(table))
            .fetch_one(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CountRows))?;
        row_count(&row)
    }

    #[instrument(name = "postgres.find_record", skip(self))]
    async fn find_record(&self, id: RecordId) -> Result<Option<Record>, StorageError> {
        let row = query("SELECT id, name, created_at FROM t_records WHERE id = $1")
            .bind(id.into_inner())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Inspect))?;
        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(name = "postgres.records", skip(self))]
    async fn records(&self) -> Result<Vec<Record>, StorageError> {
        let rows = query("SELECT id, name, created_at FROM t_records ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Inspect))?;
        rows.iter().map(record_from_row).collect()
    }

    /// Audit rows ordered by `audit_date`, then id.
    #[instrument(name = "postgres.audits", skip(self))]
    async fn audits(&self) -> Result<Vec<AuditEntry>, StorageError> {
        let rows = query(
            "SELECT id, operation, name, audit_date FROM t_audits ORDER BY audit_date, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::Inspect))?;
        rows.iter().map(audit_from_row).collect()
    }
}

/// One PostgreSQL transaction owned by a scope.
pub struct PostgresSession {
    tx: Transaction<'static, Postgres>,
}

impl StorageSession for PostgresSession {
    #[instrument(name = "postgres.execute", skip(self, statement))]
    async fn execute(&mut self, statement: Statement) -> Result<u64, StorageError> {
        let result = match statement {
            Statement::InsertRecord(record) => {
                debug!(id = %record.id, "[postgres.execute] inserting record");
                query("INSERT INTO t_records (id, name, created_at) VALUES ($1, $2, $3)")
                    .bind(record.id.into_inner())
                    .bind(record.name.into_inner())
                    .bind(record.created_at.into_datetime())
                    .execute(&mut *self.tx)
                    .await
                    .map_err(|error| map_insert_error(error, Table::Records, record.id))?
            }
            Statement::InsertAudit(entry) => {
                query(
                    "INSERT INTO t_audits (id, operation, name, audit_date) VALUES ($1, $2, $3, $4)",
                )
                .bind(entry.id.into_inner())
                .bind(entry.operation.into_inner())
                .bind(entry.name)
                .bind(entry.audited_at.into_datetime())
                .execute(&mut *self.tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::Execute))?
            }
            Statement::DeleteAll(table) => query(delete_query(table))
                .execute(&mut *self.tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::Execute))?,
        };
        Ok(result.rows_affected())
    }

    #[instrument(name = "postgres.session_count_rows", skip(self))]
    async fn count_rows(&mut self, table: Table) -> Result<u64, StorageError> {
        let row = query(count_query(table))
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CountRows))?;
        row_count(&row)
    }

    #[instrument(name = "postgres.commit", skip(self))]
    async fn commit(self) -> Result<(), StorageError> {
        self.tx
            .commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))
    }

    #[instrument(name = "postgres.rollback", skip(self))]
    async fn rollback(self) -> Result<(), StorageError> {
        self.tx
            .rollback()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::RollbackTransaction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let config = PostgresConfig::default();
        let max: std::num::NonZeroU32 = config.max_connections.into();

        assert_eq!(max.get(), 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn table_queries_name_the_physical_tables() {
        assert!(count_query(Table::Records).ends_with("t_records"));
        assert!(delete_query(Table::Audits).ends_with("t_audits"));
    }

    #[test]
    fn commit_errors_map_to_commit_failed() {
        let error = map_sqlx_error(sqlx::Error::PoolTimedOut, Operation::CommitTransaction);
        assert!(matches!(error, StorageError::CommitFailed(_)));

        let error = map_sqlx_error(sqlx::Error::PoolTimedOut, Operation::BeginTransaction);
        assert!(matches!(error, StorageError::Unavailable(_)));
    }

    #[test]
    fn non_database_insert_errors_are_backend_errors() {
        let error = map_insert_error(sqlx::Error::RowNotFound, Table::Records, RecordId::new(1));
        assert!(matches!(error, StorageError::Backend(_)));
    }
}
