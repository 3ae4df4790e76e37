//! Configuration for the trigger handler.
//!
//! ```json
//! { "queue": "orders", "first_id": 100 }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{QueueName, QueueNameError, RecordId};

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document is not valid JSON or does not match the expected shape.
    #[error("invalid configuration document: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The queue name failed validation.
    #[error("invalid queue name: {0}")]
    InvalidQueue(#[from] QueueNameError),
}

/// Where the trigger handler reads from and how it numbers records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
    /// Queue drained by the handler.
    pub queue: QueueName,
    /// Id given to the first record of every handling pass (default: 0)
    #[serde(default = "default_first_id")]
    pub first_id: RecordId,
}

fn default_first_id() -> RecordId {
    RecordId::new(0)
}

impl TriggerConfig {
    /// Configuration for `queue` with ids starting at 0.
    pub fn new(queue: impl Into<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            queue: QueueName::try_new(queue)?,
            first_id: default_first_id(),
        })
    }

    /// Start record ids at `first_id`.
    #[must_use]
    pub fn with_first_id(mut self, first_id: RecordId) -> Self {
        self.first_id = first_id;
        self
    }

    /// Parse and validate a JSON document.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(document)?)
    }
}
