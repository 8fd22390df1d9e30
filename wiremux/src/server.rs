//! Server side of an exchange: accept, dispatch, reply with the same id.
//!
//! Each accepted stream gets its own connection and serving task, and each
//! call its own handler task. The reply to a call always carries that
//! call's message id, whatever order handlers finish in.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::rc::Rc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::MessageCodec;
use crate::connection::Connection;
use crate::envelope::Envelope;
use crate::providers::{NetListener, NetworkProvider};
use crate::trace::{TraceEvent, TraceHook};

/// What a handler produces: reply arguments, or an error message sent back
/// as an error envelope.
pub type HandlerResult = Result<Vec<Vec<u8>>, String>;

type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult>>>;
type Handler = Rc<dyn Fn(Vec<Vec<u8>>) -> HandlerFuture>;
type HandlerMap = Rc<RefCell<HashMap<String, Handler>>>;

/// Accepts inbound connections and dispatches calls to registered
/// service handlers.
pub struct RpcServer<N, C>
where
    N: NetworkProvider + 'static,
    C: MessageCodec,
{
    net: N,
    codec: C,
    handlers: HandlerMap,
    trace: Option<Rc<dyn TraceHook>>,
}

impl<N, C> RpcServer<N, C>
where
    N: NetworkProvider + 'static,
    C: MessageCodec,
{
    /// Create a server with no handlers registered.
    pub fn new(net: N, codec: C) -> Self {
        Self {
            net,
            codec,
            handlers: Rc::new(RefCell::new(HashMap::new())),
            trace: None,
        }
    }

    /// Install an observation hook for server-side trace points.
    #[must_use]
    pub fn with_trace_hook(mut self, hook: Rc<dyn TraceHook>) -> Self {
        self.trace = Some(hook);
        self
    }

    /// Register the handler for `service`, replacing any previous one.
    ///
    /// Registration works before and after `serve`; live connections see
    /// the new handler on their next call.
    pub fn register<F, Fut>(&self, service: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Vec<u8>>) -> Fut + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        let handler: Handler = Rc::new(move |args| Box::pin(handler(args)));
        self.handlers.borrow_mut().insert(service.into(), handler);
    }

    /// Bind `addr` and start accepting connections in the background.
    ///
    /// Returns a handle carrying the bound address, useful with port 0.
    /// Shutting the handle down stops accepting; connections already
    /// established drain when their peer disconnects.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the listener cannot be bound.
    pub async fn serve(&self, addr: &str) -> io::Result<ServerHandle> {
        let listener = self.net.bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "listening");

        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
        let handlers = self.handlers.clone();
        let trace = self.trace.clone();
        let codec = self.codec.clone();

        let task = tokio::task::spawn_local(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,

                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "accepted connection");
                            tokio::task::spawn_local(serve_connection(
                                stream,
                                peer,
                                codec.clone(),
                                handlers.clone(),
                                trace.clone(),
                            ));
                        }
                        Err(error) => {
                            tracing::warn!(%error, "accept failed, stopping listener");
                            break;
                        }
                    }
                }
            }
        });

        Ok(ServerHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

/// Handle to a running listener.
pub struct ServerHandle {
    local_addr: String,
    shutdown_tx: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

/// Serve one accepted stream until the peer disconnects.
///
/// Each call runs in its own task, so a slow handler never blocks later
/// calls on the same connection. Replies may therefore leave out of
/// order; correlation is by id, not by position.
async fn serve_connection<S, C>(
    stream: S,
    peer: String,
    codec: C,
    handlers: HandlerMap,
    trace: Option<Rc<dyn TraceHook>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
    C: MessageCodec,
{
    let conn = Rc::new(Connection::incoming(stream, codec, peer.clone()));
    let Some(mut inbound) = conn.take_inbound() else {
        return;
    };

    loop {
        let call = tokio::select! {
            maybe = inbound.recv() => match maybe {
                Some(call) => call,
                None => break,
            },
            _ = conn.closed() => break,
        };

        if let Some(hook) = &trace {
            hook.server_receive(&TraceEvent::from_envelope(&peer, &call));
        }

        // The borrow must not be held across the handler await.
        let handler = handlers.borrow().get(&call.service).cloned();
        tokio::task::spawn_local(handle_call(
            call,
            handler,
            conn.clone(),
            peer.clone(),
            trace.clone(),
        ));
    }

    tracing::debug!(%peer, "peer disconnected");
    conn.close().await;
}

/// Run one handler and write the reply back with the call's id.
async fn handle_call<C: MessageCodec>(
    call: Envelope,
    handler: Option<Handler>,
    conn: Rc<Connection<C>>,
    peer: String,
    trace: Option<Rc<dyn TraceHook>>,
) {
    let id = call.id;
    let service = call.service;

    let reply = match handler {
        Some(handler) => match handler(call.args).await {
            Ok(args) => Envelope::reply(id, service, args),
            Err(message) => {
                tracing::debug!(id, %message, "handler returned an error");
                Envelope::error(id, service, &message)
            }
        },
        None => {
            tracing::warn!(id, %service, "no handler registered");
            let message = format!("unknown service: {service}");
            Envelope::error(id, service, &message)
        }
    };

    if let Some(hook) = &trace {
        hook.server_send(&TraceEvent::from_envelope(&peer, &reply));
    }
    // The peer may already be gone; nothing to do about it here.
    let _ = conn.send(&reply);
}
