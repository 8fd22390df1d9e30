//! Client side of an exchange: one call, one correlated reply.
//!
//! An operation registers its pending entry before the envelope is queued,
//! so the reply cannot race the registration. Abandoning the operation for
//! any reason evicts the entry, so a reply arriving later finds nothing to
//! resolve and is dropped by the connection.

use std::rc::Rc;
use std::time::Duration;

use crate::codec::MessageCodec;
use crate::connection::Connection;
use crate::envelope::{Envelope, MessageKind};
use crate::error::{CallError, ConnectionError};
use crate::providers::{NetworkProvider, TimeProvider};
use crate::registry::PeerRegistry;
use crate::trace::{TraceEvent, TraceHook};

/// Evicts the pending entry if the operation is abandoned before a reply
/// resolves it.
struct PendingGuard<'a, C: MessageCodec> {
    conn: &'a Connection<C>,
    id: u32,
    armed: bool,
}

impl<C: MessageCodec> PendingGuard<'_, C> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<C: MessageCodec> Drop for PendingGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.discard_pending(self.id);
        }
    }
}

/// Run one call over an established connection and return the reply
/// envelope as received, error kind included.
pub(crate) async fn call_on<C, T>(
    conn: &Connection<C>,
    time: &T,
    trace: Option<&dyn TraceHook>,
    service: &str,
    args: Vec<Vec<u8>>,
    deadline: Duration,
) -> Result<Envelope, CallError>
where
    C: MessageCodec,
    T: TimeProvider,
{
    let id = conn.next_message_id();
    let receiver = conn.register_reply(id)?;
    let mut guard = PendingGuard {
        conn,
        id,
        armed: true,
    };

    let envelope = Envelope::call(id, service, args);
    let event = TraceEvent::from_envelope(&conn.destination(), &envelope);
    let abandon = || {
        if let Some(hook) = trace {
            hook.client_abandon(&event);
        }
    };

    if let Some(hook) = trace {
        hook.client_send(&event);
    }
    if let Err(error) = conn.send(&envelope) {
        abandon();
        return Err(error);
    }

    let reply = match time.timeout(deadline, receiver).await {
        Ok(Ok(result)) => {
            // The entry was removed at delivery time, whatever the outcome.
            guard.disarm();
            match result {
                Ok(reply) => reply,
                Err(error) => {
                    abandon();
                    return Err(error);
                }
            }
        }
        // Sender dropped without a resolution; treat as a dead channel.
        Ok(Err(_)) => {
            abandon();
            return Err(ConnectionError::Closed.into());
        }
        Err(_) => {
            tracing::debug!(id, service, "request timed out");
            abandon();
            return Err(CallError::Timeout);
        }
    };

    if let Some(hook) = trace {
        hook.client_receive(&TraceEvent::from_envelope(&conn.destination(), &reply));
    }
    Ok(reply)
}

/// Turn a reply envelope into the caller-facing result.
pub(crate) fn unwrap_reply(reply: Envelope) -> Result<Vec<Vec<u8>>, CallError> {
    match reply.kind {
        MessageKind::Error => {
            let Some(message) = reply.args.first() else {
                return Err(CallError::InvalidMessage {
                    reason: "error reply carried no message".to_string(),
                });
            };
            Err(CallError::Remote {
                message: String::from_utf8_lossy(message).into_owned(),
            })
        }
        _ => Ok(reply.args),
    }
}

/// Issues calls to remote peers through a shared registry.
pub struct RpcClient<N, T, C>
where
    N: NetworkProvider + 'static,
    T: TimeProvider + 'static,
    C: MessageCodec,
{
    registry: Rc<PeerRegistry<N, T, C>>,
    time: T,
    request_timeout: Duration,
    trace: Option<Rc<dyn TraceHook>>,
}

impl<N, T, C> RpcClient<N, T, C>
where
    N: NetworkProvider + 'static,
    T: TimeProvider + 'static,
    C: MessageCodec,
{
    /// Create a client over the given registry.
    ///
    /// The default per-call deadline comes from the registry's connection
    /// settings.
    pub fn new(registry: Rc<PeerRegistry<N, T, C>>, time: T) -> Self {
        let request_timeout = registry.config().request_timeout;
        Self {
            registry,
            time,
            request_timeout,
            trace: None,
        }
    }

    /// Install an observation hook for client-side trace points.
    #[must_use]
    pub fn with_trace_hook(mut self, hook: Rc<dyn TraceHook>) -> Self {
        self.trace = Some(hook);
        self
    }

    /// Override the default per-call deadline.
    #[must_use]
    pub fn with_request_timeout(mut self, deadline: Duration) -> Self {
        self.request_timeout = deadline;
        self
    }

    /// The default per-call deadline.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Call `service` on the peer at `addr` with the default deadline.
    ///
    /// # Errors
    ///
    /// See [`call_with_timeout`](Self::call_with_timeout).
    pub async fn call(
        &self,
        addr: &str,
        service: &str,
        args: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, CallError> {
        self.call_with_timeout(addr, service, args, self.request_timeout)
            .await
    }

    /// Call `service` on the peer at `addr`, waiting at most `deadline`
    /// for the reply.
    ///
    /// # Errors
    ///
    /// - [`CallError::Connection`] if the peer's connection cannot be
    ///   established or dies while the call is in flight
    /// - [`CallError::Timeout`] if no reply arrives before `deadline`; the
    ///   pending entry is evicted, so a later reply is dropped
    /// - [`CallError::Remote`] if the peer answers with an error envelope
    pub async fn call_with_timeout(
        &self,
        addr: &str,
        service: &str,
        args: Vec<Vec<u8>>,
        deadline: Duration,
    ) -> Result<Vec<Vec<u8>>, CallError> {
        let reply = self
            .call_envelope(addr, service, args, deadline)
            .await?;
        unwrap_reply(reply)
    }

    /// Like [`call_with_timeout`](Self::call_with_timeout), but return the
    /// reply envelope as received instead of unwrapping it.
    ///
    /// An error-kind reply is `Ok` here; only transport-level failures are
    /// `Err`. Adapters that reconstruct reply metadata for a foreign
    /// deserializer need the envelope intact.
    ///
    /// # Errors
    ///
    /// Connection and timeout errors, as for
    /// [`call_with_timeout`](Self::call_with_timeout).
    pub async fn call_envelope(
        &self,
        addr: &str,
        service: &str,
        args: Vec<Vec<u8>>,
        deadline: Duration,
    ) -> Result<Envelope, CallError> {
        let conn = self.registry.resolve(addr);
        conn.ready().await?;
        call_on(
            &conn,
            &self.time,
            self.trace.as_deref(),
            service,
            args,
            deadline,
        )
        .await
    }
}
