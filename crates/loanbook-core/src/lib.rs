use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ClientId(pub i64);

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One client loan record as persisted by the store.
///
/// `id` is the store-assigned surrogate key; `(name, created_at)` is the
/// natural key used for restore deduplication. `created_at` stays a plain
/// timestamp string so that snapshots produced elsewhere keep their original
/// key bytes through a restore round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientRecord {
    pub id: ClientId,
    pub name: String,
    pub loan: f64,
    pub repaid: f64,
    pub created_at: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl ClientRecord {
    /// Derived balance; may be negative when overpaid. Never persisted.
    #[must_use]
    pub fn outstanding(&self) -> f64 {
        self.loan - self.repaid
    }
}

/// A validated create-or-update submission for one client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSubmission {
    pub name: String,
    pub loan: f64,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl ClientSubmission {
    /// Validate raw submission fields into a well-formed submission.
    ///
    /// `loan` accepts a JSON number or a numeric string.
    ///
    /// # Errors
    /// Returns [`ClientError::Validation`] when `name` is blank or `loan` is
    /// missing or non-numeric.
    pub fn new(
        name: String,
        loan: &Value,
        email: Option<String>,
        phone: Option<String>,
    ) -> Result<Self, ClientError> {
        if name.trim().is_empty() {
            return Err(ClientError::Validation("name MUST be non-empty".to_string()));
        }

        let loan = coerce_amount(loan).ok_or_else(|| {
            ClientError::Validation("loan MUST be a numeric amount".to_string())
        })?;

        Ok(Self { name, loan, email, phone })
    }
}

/// One backup element that passed the whole-batch validation gate.
///
/// Any incoming surrogate id has already been discarded; the store assigns a
/// fresh one on insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreCandidate {
    pub name: String,
    pub loan: f64,
    pub repaid: f64,
    pub created_at: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Coerce a JSON value into a finite amount.
///
/// Accepts numbers and numeric strings; everything else is rejected.
#[must_use]
pub fn coerce_amount(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|amount| amount.is_finite())
}

/// Validate a parsed backup payload into restore candidates, fail-fast.
///
/// The gate is batch-atomic: the payload must be a JSON array and every
/// element must carry a non-empty `name` and a numeric `loan`. One bad
/// element rejects the whole batch before any store write happens.
///
/// # Errors
/// Returns [`ClientError::Validation`] naming the first failing check and
/// element index.
pub fn validate_snapshot(payload: &Value) -> Result<Vec<RestoreCandidate>, ClientError> {
    let Some(elements) = payload.as_array() else {
        return Err(ClientError::Validation("backup payload is not an array".to_string()));
    };

    let mut candidates = Vec::with_capacity(elements.len());
    for (index, element) in elements.iter().enumerate() {
        let Some(entry) = element.as_object() else {
            return Err(ClientError::Validation(format!(
                "backup element {index} is not an object"
            )));
        };

        // Blankness is checked on the trimmed view, but the stored name keeps
        // its original bytes: names are part of the natural key, and rewriting
        // them would make re-restoring an exported snapshot insert duplicates.
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| {
                ClientError::Validation(format!(
                    "backup element {index} is missing a non-empty name"
                ))
            })?;

        let loan = entry.get("loan").and_then(coerce_amount).ok_or_else(|| {
            ClientError::Validation(format!(
                "backup element {index} has a missing or non-numeric loan"
            ))
        })?;

        candidates.push(RestoreCandidate {
            name: name.to_string(),
            loan,
            repaid: entry.get("repaid").and_then(coerce_amount).unwrap_or(0.0),
            created_at: entry
                .get("created_at")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            email: entry.get("email").and_then(Value::as_str).map(ToString::to_string),
            phone: entry.get("phone").and_then(Value::as_str).map(ToString::to_string),
        });
    }

    Ok(candidates)
}

/// Current UTC instant formatted as an RFC3339 timestamp string.
///
/// # Errors
/// Returns [`ClientError::Store`] when the timestamp cannot be formatted.
pub fn now_rfc3339() -> Result<String, ClientError> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ClientError::Store(format!("failed to format RFC3339 timestamp: {err}")))
}
