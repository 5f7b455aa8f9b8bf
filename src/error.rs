//! Defines the errors surfaced by the trigger to its invoking
//! runtime.
//!
//! The variants map to a redelivery policy: malformed events and
//! configuration errors fail identically on every delivery, so the
//! runtime should route them to a dead-letter destination instead of
//! retrying. Submission failures are worth redelivering, since job
//! names are deterministic and a redelivered event can't produce a
//! second job.

use std::fmt;
use thiserror::Error;

/// The stages of a single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Decoded,
    RequestBuilt,
    Submitted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Received => "received",
            Stage::Decoded => "decoded",
            Stage::RequestBuilt => "request built",
            Stage::Submitted => "submitted",
        })
    }
}

/// The error taxonomy of a single trigger invocation.
#[derive(Error, Debug)]
pub enum TriggerError {
    /// The notification lacks a required field, or carries one that
    /// can't be decoded.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// The static configuration is incomplete or invalid, or the
    /// downstream service permanently rejected a request built from
    /// it.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The downstream service could not be reached, or kept failing
    /// until local retries were exhausted.
    #[error("job submission failed after {attempts} attempt(s): {source:#}")]
    SubmissionFailed {
        /// Total attempts performed, including the first one.
        attempts: u32,
        /// The last underlying cause.
        #[source]
        source: anyhow::Error,
    },
}

impl TriggerError {
    /// Whether redelivering the same event may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TriggerError::SubmissionFailed { .. })
    }
}

/// A failed invocation: the error, and the last stage the invocation
/// reached before it.
#[derive(Error, Debug)]
#[error("invocation failed at the {stage} stage: {error}")]
pub struct InvocationError {
    pub stage: Stage,
    pub error: TriggerError,
}

impl InvocationError {
    pub fn new(stage: Stage, error: TriggerError) -> Self {
        InvocationError { stage, error }
    }

    /// Whether redelivering the same event may succeed.
    pub fn is_retriable(&self) -> bool {
        self.error.is_retriable()
    }
}
