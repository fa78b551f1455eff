//! # Normalize
//!
//! Turns inbound submissions of any supported kind into a `CanonicalRecord`.
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_derive::Deserialize;
use thiserror::Error;

use crate::record::{CanonicalRecord, Origin};

/// Enumeration of reasons a submission is rejected before it reaches the queue.
/// These are always caused by the client and are never retried.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("unsupported content type '{0}', use application/json or text/plain")]
    UnsupportedKind(String),
}

/// The declared kind of an inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    Text,
    Other(String),
}

impl ContentKind {
    /// Classify a Content-Type header value, ignoring parameters like `charset`.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let media_type = content_type
            .unwrap_or_default()
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();

        match media_type.as_str() {
            "application/json" => ContentKind::Json,
            "text/plain" => ContentKind::Text,
            _ => ContentKind::Other(media_type),
        }
    }
}

/// The body of a structured submission.
/// Every field is optional here so that a missing field can be told apart from a malformed one.
#[derive(Deserialize, Debug)]
struct StructuredSubmission {
    tenant_id: Option<String>,
    text: Option<String>,
    #[serde(alias = "log_id")]
    record_id: Option<String>,
}

struct NormalizerState {
    rng: StdRng,
    last_received_at: Option<DateTime<Utc>>,
}

/// Builds `CanonicalRecord`s from raw submissions.
///
/// Identifiers are drawn from the random source handed over at construction, so tests can seed it.
/// `received_at` never goes backwards within one `Normalizer`, even if the wall clock does.
pub struct Normalizer {
    state: Mutex<NormalizerState>,
}

impl Normalizer {
    pub fn new(rng: StdRng) -> Self {
        Self {
            state: Mutex::new(NormalizerState {
                rng,
                last_received_at: None,
            }),
        }
    }

    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }

    /// Normalize a payload of the declared `kind`.
    ///
    /// # Arguments
    ///
    /// * `kind`: The content kind declared by the client.
    /// * `body`: The raw payload bytes.
    /// * `tenant_hint`: Tenant identity supplied out-of-band, only used for raw text submissions.
    pub fn normalize(
        &self,
        kind: &ContentKind,
        body: &[u8],
        tenant_hint: Option<&str>,
    ) -> Result<CanonicalRecord, ValidationError> {
        match kind {
            ContentKind::Json => self.normalize_structured(body),
            ContentKind::Text => self.normalize_text(body, tenant_hint),
            ContentKind::Other(media_type) => {
                Err(ValidationError::UnsupportedKind(media_type.to_owned()))
            }
        }
    }

    fn normalize_structured(&self, body: &[u8]) -> Result<CanonicalRecord, ValidationError> {
        let submission: StructuredSubmission = serde_json::from_slice(body)
            .map_err(|error| ValidationError::Malformed(error.to_string()))?;

        let tenant_id = non_empty(submission.tenant_id)
            .ok_or(ValidationError::MissingField("tenant_id"))?;
        let text = non_empty(submission.text).ok_or(ValidationError::MissingField("text"))?;

        let mut state = self.lock();
        let record_id = match non_empty(submission.record_id) {
            Some(record_id) => record_id,
            None => state.generate_id(),
        };

        Ok(CanonicalRecord {
            tenant_id,
            record_id,
            origin: Origin::JsonSubmission,
            raw_text: text,
            received_at: state.received_at(),
        })
    }

    fn normalize_text(
        &self,
        body: &[u8],
        tenant_hint: Option<&str>,
    ) -> Result<CanonicalRecord, ValidationError> {
        let tenant_id = tenant_hint
            .filter(|tenant| !tenant.is_empty())
            .ok_or(ValidationError::MissingField("tenant_id"))?;

        let mut state = self.lock();

        Ok(CanonicalRecord {
            tenant_id: tenant_id.to_owned(),
            record_id: state.generate_id(),
            origin: Origin::TextSubmission,
            raw_text: String::from_utf8_lossy(body).into_owned(),
            received_at: state.received_at(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NormalizerState> {
        // Nothing in the state can be left half-updated, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NormalizerState {
    fn generate_id(&mut self) -> String {
        let bytes: [u8; 16] = self.rng.gen();
        uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .hyphenated()
            .to_string()
    }

    fn received_at(&mut self) -> DateTime<Utc> {
        let now = match self.last_received_at {
            Some(last) => std::cmp::max(Utc::now(), last),
            None => Utc::now(),
        };
        self.last_received_at = Some(now);
        now
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
