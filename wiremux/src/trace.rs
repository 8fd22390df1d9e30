//! Observation hooks for the points of an RPC exchange.
//!
//! A hook sees a call leave the client, arrive at the server, leave the
//! server, and arrive back at the client; a client that gives up without
//! a reply signals abandonment instead. Hooks observe only: they cannot
//! alter envelopes or outcomes, and a panicking hook is a defect in the
//! hook, not in the transport.

use crate::envelope::Envelope;

/// What a hook learns about the exchange at each point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// Address of the remote peer.
    pub peer: String,
    /// Service the call is addressed to.
    pub service: String,
    /// Correlation id of the exchange.
    pub message_id: u32,
}

impl TraceEvent {
    pub(crate) fn from_envelope(peer: &str, envelope: &Envelope) -> Self {
        Self {
            peer: peer.to_string(),
            service: envelope.service.clone(),
            message_id: envelope.id,
        }
    }
}

/// Hook invoked at the four points of an exchange.
///
/// Every method has an empty default body so implementors only override
/// the points they care about.
#[allow(unused_variables)]
pub trait TraceHook {
    /// The client is about to send a call.
    fn client_send(&self, event: &TraceEvent) {}

    /// The client received the reply to a call it sent.
    fn client_receive(&self, event: &TraceEvent) {}

    /// The client gave up on a call without a reply, because the deadline
    /// elapsed or the connection died. Terminal for the exchange: no
    /// further point fires for this `(peer, id)`.
    fn client_abandon(&self, event: &TraceEvent) {}

    /// The server received an inbound call.
    fn server_receive(&self, event: &TraceEvent) {}

    /// The server is about to send its reply.
    fn server_send(&self, event: &TraceEvent) {}
}

/// Hook that emits a structured log line per point.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTraceHook;

impl TraceHook for LogTraceHook {
    fn client_send(&self, event: &TraceEvent) {
        tracing::info!(
            peer = %event.peer,
            service = %event.service,
            id = event.message_id,
            "client send"
        );
    }

    fn client_receive(&self, event: &TraceEvent) {
        tracing::info!(
            peer = %event.peer,
            service = %event.service,
            id = event.message_id,
            "client receive"
        );
    }

    fn client_abandon(&self, event: &TraceEvent) {
        tracing::info!(
            peer = %event.peer,
            service = %event.service,
            id = event.message_id,
            "client abandon"
        );
    }

    fn server_receive(&self, event: &TraceEvent) {
        tracing::info!(
            peer = %event.peer,
            service = %event.service,
            id = event.message_id,
            "server receive"
        );
    }

    fn server_send(&self, event: &TraceEvent) {
        tracing::info!(
            peer = %event.peer,
            service = %event.service,
            id = event.message_id,
            "server send"
        );
    }
}

/// One timestamped annotation within an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    /// Which point produced the annotation.
    pub label: &'static str,
    /// Wall-clock time of the point.
    pub at: std::time::SystemTime,
}

/// Completed half of an exchange: the event plus every annotation
/// collected on this side.
#[derive(Debug, Clone)]
pub struct TraceRecord {
    /// The exchange this record describes.
    pub event: TraceEvent,
    /// Annotations in the order the points fired.
    pub annotations: Vec<Annotation>,
}

/// Collector that receives finished trace records.
pub trait TraceReporter {
    /// Accept one finished record.
    fn report(&self, record: TraceRecord);
}

/// Hook that accumulates one timestamped annotation per point and hands
/// the finished record to a reporter at the completion points: reply
/// received on the client side, reply sent on the server side.
///
/// An abandoned exchange never completes; its record is discarded at the
/// abandon point so the open map holds only in-flight exchanges.
///
/// With the enabled flag off every point is a no-op.
pub struct AnnotatingTraceHook<R: TraceReporter> {
    reporter: R,
    enabled: bool,
    open: std::cell::RefCell<std::collections::HashMap<(String, u32), TraceRecord>>,
}

impl<R: TraceReporter> AnnotatingTraceHook<R> {
    /// Create a hook flushing to `reporter`.
    pub fn new(reporter: R, enabled: bool) -> Self {
        Self {
            reporter,
            enabled,
            open: std::cell::RefCell::new(std::collections::HashMap::new()),
        }
    }

    fn annotate(&self, event: &TraceEvent, label: &'static str) {
        let key = (event.peer.clone(), event.message_id);
        let mut open = self.open.borrow_mut();
        let record = open.entry(key).or_insert_with(|| TraceRecord {
            event: event.clone(),
            annotations: Vec::new(),
        });
        record.annotations.push(Annotation {
            label,
            at: std::time::SystemTime::now(),
        });
    }

    fn flush(&self, event: &TraceEvent, label: &'static str) {
        self.annotate(event, label);
        let key = (event.peer.clone(), event.message_id);
        let record = self.open.borrow_mut().remove(&key);
        if let Some(record) = record {
            self.reporter.report(record);
        }
    }

    /// Number of exchanges still awaiting their completion point.
    pub fn open_exchanges(&self) -> usize {
        self.open.borrow().len()
    }
}

impl<R: TraceReporter> TraceHook for AnnotatingTraceHook<R> {
    fn client_send(&self, event: &TraceEvent) {
        if self.enabled {
            self.annotate(event, "client send");
        }
    }

    fn client_receive(&self, event: &TraceEvent) {
        if self.enabled {
            self.flush(event, "client receive");
        }
    }

    fn client_abandon(&self, event: &TraceEvent) {
        if self.enabled {
            let key = (event.peer.clone(), event.message_id);
            self.open.borrow_mut().remove(&key);
        }
    }

    fn server_receive(&self, event: &TraceEvent) {
        if self.enabled {
            self.annotate(event, "server receive");
        }
    }

    fn server_send(&self, event: &TraceEvent) {
        if self.enabled {
            self.flush(event, "server send");
        }
    }
}
