use thiserror::Error;

/// Domain errors raised anywhere in the ingest/extraction/remittance/export pipeline.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("configuration error: {0}")]
    Fatal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    pub fn stage_violation(expected: &str, actual: &str) -> Self {
        Self::InvariantViolation(format!(
            "stage order violation: expected '{expected}', got '{actual}'"
        ))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// The error taxonomy, modeled as a classification trait rather than a parallel
/// error enum: the retry decision in the worker runtime is a pure function of
/// this classification, computed directly off whichever leaf error type a worker
/// returned. Adding a new error source only requires implementing this trait once.
pub trait ErrorClass {
    fn class(&self) -> FailureClass;

    fn is_retryable(&self) -> bool {
        matches!(self.class(), FailureClass::Transient)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network errors, timeouts, HTTP 429/5xx, broker unavailability, DB deadlocks.
    Transient,
    /// Schema rejection, missing required field, malformed input.
    Validation,
    /// Broken hash chain, text-hash mismatch, lineage cycle.
    Integrity,
    /// Missing startup configuration; the process should abort.
    Fatal,
}

impl ErrorClass for CoreError {
    fn class(&self) -> FailureClass {
        match self {
            CoreError::Transient(_) => FailureClass::Transient,
            CoreError::Validation(_) => FailureClass::Validation,
            CoreError::Integrity(_) => FailureClass::Integrity,
            CoreError::Fatal(_) => FailureClass::Fatal,
            CoreError::NotFound(_) => FailureClass::Validation,
            CoreError::PermissionDenied(_) => FailureClass::Validation,
            CoreError::InvariantViolation(_) => FailureClass::Integrity,
            CoreError::Duplicate(_) => FailureClass::Validation,
            CoreError::Serialization(_) => FailureClass::Validation,
        }
    }
}

/// Classifies a raw HTTP status the way vendor and broker adapters observe it,
/// independent of any particular error enum.
pub fn classify_http_status(status: u16) -> FailureClass {
    if status == 429 || (500..600).contains(&status) {
        FailureClass::Transient
    } else {
        FailureClass::Validation
    }
}
