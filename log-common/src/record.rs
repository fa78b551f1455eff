use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a record entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    JsonSubmission,
    TextSubmission,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::JsonSubmission => "json_submission",
            Origin::TextSubmission => "text_submission",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid Origin")]
pub struct ParseOriginError(String);

impl FromStr for Origin {
    type Err = ParseOriginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json_submission" => Ok(Origin::JsonSubmission),
            "text_submission" => Ok(Origin::TextSubmission),
            invalid => Err(ParseOriginError(invalid.to_owned())),
        }
    }
}

/// The single normalized shape every inbound submission converges to before it is queued.
///
/// A `CanonicalRecord` is never mutated after the normalizer builds it. It crosses the queue as a
/// serialized copy, and anything derived from it (like redacted text) lives in a
/// `PersistedLogEntry` instead of overwriting `raw_text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub tenant_id: String,
    pub record_id: String,
    pub origin: Origin,
    /// The submitted text, exactly as received.
    pub raw_text: String,
    pub received_at: DateTime<Utc>,
}

/// The durable form of a `CanonicalRecord`, keyed by `(tenant_id, record_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedLogEntry {
    pub tenant_id: String,
    pub record_id: String,
    pub origin: Origin,
    pub raw_text: String,
    pub sanitized_text: String,
    pub received_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

impl PersistedLogEntry {
    pub fn new(
        record: CanonicalRecord,
        sanitized_text: String,
        processed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: record.tenant_id,
            record_id: record.record_id,
            origin: record.origin,
            raw_text: record.raw_text,
            sanitized_text,
            received_at: record.received_at,
            processed_at,
        }
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.tenant_id, &self.record_id)
    }
}
