//! Error types for isolated invocations
//!
//! Domain errors use thiserror. Everything that crosses the isolate boundary
//! (rejections) is a plain serializable value so it can travel inside a frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::io;
use thiserror::Error;

/// Message carried by the rejection of a terminated invocation
pub const TERMINATED_MESSAGE: &str = "WORKER_TERMINATED";

/// Reason an invocation did not resolve
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvocationError {
    /// The user computation returned an error (or its future did)
    #[error("{0}")]
    Rejected(#[from] Failure),

    /// The isolate failed outside the message protocol
    #[error("isolate fault: {0}")]
    Fault(IsolateFault),

    /// The invocation was terminated before it settled
    #[error("WORKER_TERMINATED")]
    Terminated,

    /// A value could not be marshaled on the controller side
    #[error("marshal error: {0}")]
    Marshal(String),
}

impl InvocationError {
    /// True for the termination sentinel
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// True when the isolate itself failed
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }

    /// The computation error, if this is a rejection
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Rejected(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for InvocationError {
    fn from(err: anyhow::Error) -> Self {
        Self::Rejected(Failure::from(err))
    }
}

/// Error value produced by a user computation.
///
/// This is the payload of a `REJECT` frame. The message is exactly the
/// display text of the error the computation returned; `causes` keeps the
/// rest of an `anyhow` chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct Failure {
    /// Display text of the outermost error
    pub message: String,

    /// Display text of each underlying cause, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl Failure {
    /// Create a failure with no causes
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            causes: Vec::new(),
        }
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            causes: err.chain().skip(1).map(ToString::to_string).collect(),
        }
    }
}

/// Failure of the isolate environment itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message} (isolate {isolate})")]
pub struct IsolateFault {
    /// What went wrong
    pub message: String,

    /// Name of the isolate that faulted
    pub isolate: String,

    /// When the controller learned about the fault
    pub occurred_at: DateTime<Utc>,
}

impl IsolateFault {
    /// Create a fault stamped with the current time
    pub fn new(isolate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            isolate: isolate.into(),
            occurred_at: Utc::now(),
        }
    }

    /// Build a fault from a caught panic payload
    pub fn from_panic(isolate: impl Into<String>, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "isolate panicked with a non-string payload".to_string()
        };
        Self::new(isolate, format!("isolate panicked: {message}"))
    }
}

/// Errors raised by an [`IsolateHost`](super::host::IsolateHost) while spawning
#[derive(Debug, Error)]
pub enum HostError {
    /// The OS refused to start the isolate thread
    #[error("failed to spawn isolate: {0}")]
    Spawn(#[from] io::Error),

    /// No runtime is available to run the isolate on
    #[error("isolate runtime unavailable: {0}")]
    Runtime(String),
}

/// A frame that breaks the message protocol.
///
/// This is an integration defect, not a runtime condition: the controller
/// never turns it into a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("protocol violation: {reason} (frame: {frame})")]
pub struct ProtocolViolation {
    /// Why the frame was refused
    pub reason: String,

    /// Lossy text of the offending frame
    pub frame: String,
}

impl ProtocolViolation {
    /// Create a violation for the given raw frame
    pub fn new(reason: impl Into<String>, frame: &[u8]) -> Self {
        Self {
            reason: reason.into(),
            frame: String::from_utf8_lossy(frame).into_owned(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A setting had a value that could not be parsed
    #[error("invalid value '{value}' for {key}")]
    Invalid {
        /// Setting name
        key: String,
        /// Rejected value
        value: String,
    },
}

/// Convenience result alias for invocation outcomes
pub type InvocationResult<T> = std::result::Result<T, InvocationError>;

/// Convenience result alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminated_display_is_sentinel() {
        assert_eq!(InvocationError::Terminated.to_string(), TERMINATED_MESSAGE);
        assert!(InvocationError::Terminated.is_terminated());
    }

    #[test]
    fn test_rejection_displays_computation_message() {
        let err = InvocationError::from(anyhow::anyhow!("aaah"));
        assert_eq!(err.to_string(), "aaah");
        assert_eq!(err.failure().map(|f| f.message.as_str()), Some("aaah"));
    }

    #[test]
    fn test_failure_keeps_cause_chain() {
        let err = anyhow::anyhow!("disk on fire").context("could not save");
        let failure = Failure::from(err);
        assert_eq!(failure.message, "could not save");
        assert_eq!(failure.causes, vec!["disk on fire".to_string()]);
    }

    #[test]
    fn test_fault_from_panic_payload() {
        let fault = IsolateFault::from_panic("iso-1", Box::new("boom"));
        assert_eq!(fault.message, "isolate panicked: boom");

        let fault = IsolateFault::from_panic("iso-1", Box::new(String::from("bang")));
        assert_eq!(fault.message, "isolate panicked: bang");

        let fault = IsolateFault::from_panic("iso-1", Box::new(7_u8));
        assert!(fault.message.contains("non-string"));
    }

    #[test]
    fn test_failure_without_causes_omits_field() {
        let json = serde_json::to_value(Failure::new("x")).unwrap();
        assert_eq!(json, serde_json::json!({ "message": "x" }));
    }
}
