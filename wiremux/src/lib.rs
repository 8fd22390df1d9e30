//! # Wiremux
//!
//! Asynchronous RPC multiplexing over shared per-peer connections.
//!
//! This crate provides:
//! - **Connection**: One physical channel per peer, multiplexing many
//!   logical requests correlated by message id
//! - **PeerRegistry**: At most one connection per remote address
//! - **RpcClient / RpcServer**: Call-and-reply operations over the
//!   registry, with per-call deadlines
//! - **Trace hooks**: Observation points at the four stages of an
//!   exchange
//! - **TransportAdapter**: Frame-stream facade for foreign
//!   serialization stacks

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Frame-stream facade for foreign serialization stacks.
pub mod adapter;

/// Client-side call operations.
pub mod client;

/// Message serialization seam.
pub mod codec;

/// Per-peer connection management.
pub mod connection;

/// Message envelope types.
pub mod envelope;

/// Error types for transport operations.
pub mod error;

/// Wire framing with CRC32C checksums.
pub mod frame;

/// Pending-response correlation table.
pub mod pending;

/// Network and time provider abstractions.
pub mod providers;

/// Peer registry: address to connection.
pub mod registry;

/// Server-side listening and dispatch.
pub mod server;

/// Observation hooks for RPC exchanges.
pub mod trace;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use adapter::{ReplyFrame, TransportAdapter};
pub use client::RpcClient;
pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use connection::{Connection, ConnectionConfig};
pub use envelope::{Envelope, MessageKind};
pub use error::{CallError, ConnectionError};
pub use frame::{
    FRAME_HEADER_SIZE, FrameError, MAX_FRAME_PAYLOAD, encode_frame, try_decode_frame,
};
pub use pending::{PendingReplies, ReplyReceiver, ReplyResult};
pub use providers::{
    Elapsed, NetListener, NetworkProvider, TimeProvider, TokioNetworkProvider,
    TokioTcpListener, TokioTimeProvider,
};
pub use registry::{PeerRegistry, PeerRequest};
pub use server::{HandlerResult, RpcServer, ServerHandle};
pub use trace::{
    AnnotatingTraceHook, Annotation, LogTraceHook, TraceEvent, TraceHook, TraceRecord,
    TraceReporter,
};
