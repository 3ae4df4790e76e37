//! Core vocabulary types for `dualcommit`.
//!
//! Everything that crosses a resource boundary is validated when it is
//! constructed, so the coordinator and handler never re-check queue names,
//! record names or identifiers.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of a point-to-point queue on the messaging resource.
///
/// `QueueName` values are trimmed, non-empty and at most 255 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        TryFrom,
        Serialize,
        Deserialize
    )
)]
pub struct QueueName(String);

/// Primary key of a [`Record`].
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    From,
    Into,
    Serialize,
    Deserialize
))]
pub struct RecordId(i64);

/// The `name` column of a [`Record`], taken verbatim from a message payload.
///
/// Not trimmed: the stored name must equal the payload that produced it.
#[nutype(
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct RecordName(String);

/// Operation label stored with an [`AuditEntry`] (e.g. `"INSERT"`).
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AuditOperation(String);

/// Identifier assigned to a message when it is first sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new time-ordered (UUIDv7) message id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one transaction scope, used to correlate log lines and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(Uuid);

impl ScopeId {
    /// Creates a new time-ordered (UUIDv7) scope id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A UTC point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A message delivered by the messaging resource.
///
/// `delivery_count` is 0 until the message is first received and grows by
/// one on every receive, so a redelivered message is seen with 2 or more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Broker-assigned identity.
    pub id: MessageId,
    /// Queue the message was sent to.
    pub queue: QueueName,
    /// Text payload.
    pub payload: String,
    /// Number of times this message has been handed to a receiver.
    pub delivery_count: u32,
}

impl Message {
    /// Creates a message that has not been delivered yet.
    pub fn new(queue: QueueName, payload: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            queue,
            payload: payload.into(),
            delivery_count: 0,
        }
    }

    /// True when an earlier delivery of this message was rolled back.
    pub const fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// A row of the records table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Primary key.
    pub id: RecordId,
    /// Payload of the message that produced this row.
    pub name: RecordName,
    /// When the row was built.
    pub created_at: Timestamp,
}

impl Record {
    /// Creates a record stamped with the current time.
    pub fn new(id: RecordId, name: RecordName) -> Self {
        Self {
            id,
            name,
            created_at: Timestamp::now(),
        }
    }
}

/// A row of the audit table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Id of the audited record.
    pub id: RecordId,
    /// What happened to it.
    pub operation: AuditOperation,
    /// Free-form name recorded alongside.
    pub name: String,
    /// When the audit row was written.
    pub audited_at: Timestamp,
}

/// Tables known to the storage resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    /// Business rows written by the trigger handler.
    Records,
    /// Audit trail rows.
    Audits,
}

impl Table {
    /// Physical table name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Records => "t_records",
            Self::Audits => "t_audits",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A write issued against a storage session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `INSERT INTO t_records (id, name, created_at)`
    InsertRecord(Record),
    /// `INSERT INTO t_audits (id, operation, name, audit_date)`
    InsertAudit(AuditEntry),
    /// `DELETE FROM <table>`
    DeleteAll(Table),
}
