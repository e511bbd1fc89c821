//! Domain error model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the engine.
pub type DomainResult<T> = Result<T, DomainError>;

/// Field-keyed validation messages (e.g. `entries.3.entity_id`).
///
/// Ordered so that error payloads are stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    /// Merge another set of errors, prefixing each field (`prefix.field`).
    pub fn merge_prefixed(&mut self, prefix: &str, other: FieldErrors) {
        for (field, messages) in other.0 {
            let key = format!("{prefix}.{field}");
            self.0.entry(key).or_default().extend(messages);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    /// `Ok(())` when empty, otherwise a `DomainError::Validation`.
    pub fn into_result(self) -> DomainResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DomainError::Validation(self))
        }
    }
}

impl core::fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            for message in messages {
                if !first {
                    f.write_str("; ")?;
                }
                write!(f, "{field}: {message}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Engine-level error.
///
/// Every engine entry point reports failures through this taxonomy. Infrastructure
/// failures are folded into `Transient` at the service boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed or missing input, out-of-range amounts, cross-tenant references.
    #[error("validation failed: {0}")]
    Validation(FieldErrors),

    /// A money invariant would be broken. Never clamped, always reported.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Unknown id, or an id owned by another company (indistinguishable on purpose).
    #[error("not found")]
    NotFound,

    /// Already reversed, duplicate idempotency key, etc.
    #[error("conflict: {message}")]
    Conflict {
        message: String,
        /// Identifier of the resource the caller should reconcile against.
        existing_id: Option<String>,
    },

    /// Lock timeout, storage outage, worker crash. Safe to retry the failed unit.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The upstream authorization decision was negative.
    #[error("unauthorized")]
    Unauthorized,
}

impl DomainError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(FieldErrors::single(field, message))
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
            existing_id: None,
        }
    }

    pub fn conflict_with(msg: impl Into<String>, existing_id: impl ToString) -> Self {
        Self::Conflict {
            message: msg.into(),
            existing_id: Some(existing_id.to_string()),
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    /// Whether retrying the same unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DomainError::Transient(_))
    }

    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match self {
            DomainError::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}
