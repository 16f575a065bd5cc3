//! Message vocabulary exchanged across the isolate boundary
//!
//! Both ends encode and decode through the single [`Message`] enum. Frames
//! are JSON objects of the form `{"kind": "RESOLVE", "payload": ...}`. The
//! set of kinds is closed and there is no version negotiation: the program
//! and the controller always come from the same factory.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::error::{Failure, ProtocolViolation};

/// A single frame's content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Controller → isolate: the invocation's input
    Input(Value),
    /// Isolate → controller: the computed result (terminal)
    Resolve(Value),
    /// Isolate → controller: the computation's error (terminal)
    Reject(Failure),
    /// Isolate → controller: an out-of-band notification
    Notify(Value),
    /// Isolate → controller: log arguments
    Log(Vec<Value>),
    /// Isolate → controller: error-log arguments
    ErrorLog(Vec<Value>),
}

/// Tag of a [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `INPUT`
    Input,
    /// `RESOLVE`
    Resolve,
    /// `REJECT`
    Reject,
    /// `NOTIFY`
    Notify,
    /// `LOG`
    Log,
    /// `ERROR_LOG`
    ErrorLog,
}

impl MessageKind {
    /// Wire tag
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Input => "INPUT",
            Self::Resolve => "RESOLVE",
            Self::Reject => "REJECT",
            Self::Notify => "NOTIFY",
            Self::Log => "LOG",
            Self::ErrorLog => "ERROR_LOG",
        }
    }

    /// Whether this kind settles the invocation
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolve | Self::Reject)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    /// Tag of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Input(_) => MessageKind::Input,
            Self::Resolve(_) => MessageKind::Resolve,
            Self::Reject(_) => MessageKind::Reject,
            Self::Notify(_) => MessageKind::Notify,
            Self::Log(_) => MessageKind::Log,
            Self::ErrorLog(_) => MessageKind::ErrorLog,
        }
    }

    /// Encode into a wire frame
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a wire frame of any kind
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolViolation> {
        serde_json::from_slice(frame).map_err(|err| ProtocolViolation::new(err.to_string(), frame))
    }
}
