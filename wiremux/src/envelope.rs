//! Message envelope: the unit of work exchanged over a connection.
//!
//! An envelope carries a service name, an ordered list of opaque argument
//! byte-strings, a message kind, and a message id. The id is assigned by
//! the connection that sends the call and echoed by the reply; it is the
//! sole correlation key between the two.

use serde::{Deserialize, Serialize};

/// What an envelope represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// An outbound call expecting a reply with the same id.
    CallRequest,
    /// A successful reply to a call.
    CallResponse,
    /// An error reply to a call.
    Error,
}

/// One logical request or reply unit.
///
/// Arguments are opaque byte-strings passed through untouched: a textual
/// endpoint name travels verbatim as bytes, binary payloads as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Per-connection correlation id. A reply's id equals the id of the
    /// call it answers.
    pub id: u32,
    /// Call, reply, or error.
    pub kind: MessageKind,
    /// Service the call is addressed to.
    pub service: String,
    /// Ordered opaque argument byte-strings.
    pub args: Vec<Vec<u8>>,
}

impl Envelope {
    /// Build a call envelope.
    pub fn call(id: u32, service: impl Into<String>, args: Vec<Vec<u8>>) -> Self {
        Self {
            id,
            kind: MessageKind::CallRequest,
            service: service.into(),
            args,
        }
    }

    /// Build a reply envelope answering the call with the same id.
    pub fn reply(id: u32, service: impl Into<String>, args: Vec<Vec<u8>>) -> Self {
        Self {
            id,
            kind: MessageKind::CallResponse,
            service: service.into(),
            args,
        }
    }

    /// Build an error envelope answering the call with the same id.
    pub fn error(id: u32, service: impl Into<String>, message: &str) -> Self {
        Self {
            id,
            kind: MessageKind::Error,
            service: service.into(),
            args: vec![message.as_bytes().to_vec()],
        }
    }

    /// Whether this envelope answers a call (reply or error).
    pub fn is_response(&self) -> bool {
        matches!(self.kind, MessageKind::CallResponse | MessageKind::Error)
    }
}
