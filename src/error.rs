//! Error types for the delivery engine.
//!
//! `ValidationError` rejects malformed requests before they ever reach the
//! queue (spec taxonomy: `validation`). `ErrorInfo` is the terminal failure
//! payload recorded on a `LifecycleRecord`/`Job` (`provider-specific`,
//! `fatal`, `timeout`, `exhausted` all surface through it — they are
//! classification labels on the same shape, not distinct Rust types, since
//! by the time an attempt terminates the engine has already decided there is
//! no further retry).

use serde::Serialize;
use thiserror::Error;

use crate::transport::FailureKind;

/// A submitted request failed one or more shape checks before admission.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("`to` must look like an email address")]
    InvalidTo,
    #[error("`subject` must be 1..=200 chars, got {0}")]
    SubjectLength(usize),
    #[error("`body` must be 1..=10000 chars, got {0}")]
    BodyLength(usize),
    #[error("`requestId` must be 1..=100 chars, got {0}")]
    RequestIdLength(usize),
    #[error("`priority` must be 0..=10, got {0}")]
    PriorityOutOfRange(i32),
    #[error("`delayMs` must be 0..=300000, got {0}")]
    DelayOutOfRange(i64),
}

/// Multiple validation failures collected from a single request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("request failed validation: {0:?}")]
pub struct ValidationErrors(pub Vec<ValidationError>);

/// Terminal failure payload recorded against a request, never including
/// transport internals such as stack traces (spec §7 user-visible behavior).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub kind: FailureKind,
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: FailureKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind, code: code.into(), message: message.into() }
    }

    /// Synthetic failure raised when a worker's watchdog timeout fires.
    pub fn processing_timeout() -> Self {
        Self::new(FailureKind::Transient, "PROCESSING_TIMEOUT", "worker watchdog timeout elapsed")
    }
}
