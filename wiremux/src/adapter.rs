//! Adapter for foreign serialization stacks that expect a frame stream.
//!
//! Some deserializers reconstruct response metadata from the byte stream
//! itself and cannot see the envelope. The adapter runs a normal call,
//! then re-emits the reply as a self-describing frame: endpoint name,
//! message kind, and id are prefixed to the payload so the foreign side
//! can recover them. This reshaping lives entirely here; nothing else in
//! the transport knows about it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tokio::sync::Notify;

use crate::client::RpcClient;
use crate::codec::MessageCodec;
use crate::envelope::{Envelope, MessageKind};
use crate::error::CallError;
use crate::providers::{NetworkProvider, TimeProvider};

/// A reply reshaped into self-describing bytes.
///
/// Layout: `[endpoint_len:2][endpoint][kind:1][id:4][payload]`, integers
/// little-endian. The payload is the last argument of the reply envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    /// Endpoint name the reply came from.
    pub endpoint: String,
    /// Kind of the reply envelope.
    pub kind: MessageKind,
    /// Correlation id of the exchange.
    pub id: u32,
    /// Reply payload bytes.
    pub payload: Vec<u8>,
}

impl ReplyFrame {
    fn from_envelope(reply: &Envelope) -> Self {
        Self {
            endpoint: reply.service.clone(),
            kind: reply.kind,
            id: reply.id,
            payload: reply.args.last().cloned().unwrap_or_default(),
        }
    }

    /// Serialize the frame.
    pub fn encode(&self) -> Vec<u8> {
        let endpoint = self.endpoint.as_bytes();
        let mut data =
            Vec::with_capacity(2 + endpoint.len() + 1 + 4 + self.payload.len());
        data.extend_from_slice(&(endpoint.len() as u16).to_le_bytes());
        data.extend_from_slice(endpoint);
        data.push(kind_byte(self.kind));
        data.extend_from_slice(&self.id.to_le_bytes());
        data.extend_from_slice(&self.payload);
        data
    }

    /// Parse a frame produced by [`encode`](Self::encode).
    ///
    /// Returns `None` if the bytes are truncated or the kind byte is
    /// unknown.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }
        let endpoint_len = u16::from_le_bytes([data[0], data[1]]) as usize;
        let rest = &data[2..];
        if rest.len() < endpoint_len + 5 {
            return None;
        }
        let endpoint = String::from_utf8(rest[..endpoint_len].to_vec()).ok()?;
        let kind = parse_kind(rest[endpoint_len])?;
        let id_bytes = &rest[endpoint_len + 1..endpoint_len + 5];
        let id = u32::from_le_bytes([id_bytes[0], id_bytes[1], id_bytes[2], id_bytes[3]]);
        let payload = rest[endpoint_len + 5..].to_vec();
        Some(Self {
            endpoint,
            kind,
            id,
            payload,
        })
    }
}

fn kind_byte(kind: MessageKind) -> u8 {
    match kind {
        MessageKind::CallRequest => 0,
        MessageKind::CallResponse => 1,
        MessageKind::Error => 2,
    }
}

fn parse_kind(byte: u8) -> Option<MessageKind> {
    match byte {
        0 => Some(MessageKind::CallRequest),
        1 => Some(MessageKind::CallResponse),
        2 => Some(MessageKind::Error),
        _ => None,
    }
}

/// Frame-stream facade over a client and one peer.
pub struct TransportAdapter<N, T, C>
where
    N: NetworkProvider + 'static,
    T: TimeProvider + 'static,
    C: MessageCodec,
{
    client: Rc<RpcClient<N, T, C>>,
    peer: String,
    frames: RefCell<VecDeque<Vec<u8>>>,
    frame_ready: Notify,
}

impl<N, T, C> TransportAdapter<N, T, C>
where
    N: NetworkProvider + 'static,
    T: TimeProvider + 'static,
    C: MessageCodec,
{
    /// Create an adapter issuing calls to the peer at `peer`.
    pub fn new(client: Rc<RpcClient<N, T, C>>, peer: impl Into<String>) -> Self {
        Self {
            client,
            peer: peer.into(),
            frames: RefCell::new(VecDeque::new()),
            frame_ready: Notify::new(),
        }
    }

    /// Call `service` with header arguments and a payload.
    ///
    /// The payload travels as the last envelope argument. On completion
    /// the reply payload is returned, and exactly one reconstructed frame
    /// is queued for [`next_frame`](Self::next_frame).
    ///
    /// # Errors
    ///
    /// Transport-level failures only; an error-kind reply still completes
    /// the exchange and yields its frame.
    pub async fn send(
        &self,
        service: &str,
        headers: Vec<Vec<u8>>,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, CallError> {
        let mut args = headers;
        args.push(payload);

        let reply = self
            .client
            .call_envelope(&self.peer, service, args, self.client.request_timeout())
            .await?;

        let frame = ReplyFrame::from_envelope(&reply);
        let payload = frame.payload.clone();
        self.frames.borrow_mut().push_back(frame.encode());
        self.frame_ready.notify_one();
        Ok(payload)
    }

    /// Yield the next reconstructed reply frame, waiting if none is
    /// queued yet.
    pub async fn next_frame(&self) -> Vec<u8> {
        loop {
            let notified = self.frame_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(frame) = self.frames.borrow_mut().pop_front() {
                return frame;
            }
            notified.await;
        }
    }

    /// Number of frames queued and not yet consumed.
    pub fn queued_frames(&self) -> usize {
        self.frames.borrow().len()
    }
}
