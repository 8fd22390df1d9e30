//! One physical channel to a peer, shared by many logical requests.
//!
//! A connection owns the message-id counter and the pending-response table
//! for its peer. All async I/O happens in a background task; the synchronous
//! API queues outbound frames and resolves inbound replies, so every
//! mutation of shared state is a non-suspending step.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::codec::MessageCodec;
use crate::envelope::Envelope;
use crate::error::{CallError, ConnectionError};
use crate::frame;
use crate::pending::{PendingReplies, ReplyReceiver};
use crate::providers::{NetworkProvider, TimeProvider};

/// Tunables for connection establishment and requests.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Timeout for the connection attempt.
    pub connect_timeout: Duration,

    /// Default deadline applied to client operations that do not set one.
    pub request_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(1),
        }
    }
}

/// Lifecycle of the underlying channel.
enum Phase {
    /// Establishment in progress; sends queue until it finishes.
    Connecting,
    /// Channel is up.
    Established,
    /// Channel failed; every pending request was resolved with this error.
    Failed(ConnectionError),
    /// Closed locally.
    Closed,
}

/// State shared between the connection handle and its background task.
struct Shared {
    destination: String,
    phase: Phase,
    /// Already-framed packets waiting for the writer.
    send_queue: VecDeque<Vec<u8>>,
}

/// One connection to a remote peer.
///
/// Shared by every client operation addressed to the same peer; the
/// registry owns it, operations only borrow it for the duration of one
/// call.
pub struct Connection<C: MessageCodec> {
    shared: Rc<RefCell<Shared>>,
    pending: Rc<PendingReplies>,
    /// Wakes the background writer when a frame is queued.
    data_to_send: Rc<Notify>,
    /// Wakes `ready()` waiters on any phase change.
    ready_notify: Rc<Notify>,
    next_id: Cell<u32>,
    codec: C,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    inbound_rx: RefCell<Option<mpsc::UnboundedReceiver<Envelope>>>,
    shutdown_tx: mpsc::UnboundedSender<()>,
    task: RefCell<Option<JoinHandle<()>>>,
}

impl<C: MessageCodec> Connection<C> {
    /// Open an outbound connection to `destination`.
    ///
    /// Returns immediately; establishment runs in a background task. Sends
    /// issued before it finishes are queued, and `ready()` reports the
    /// outcome. A failed attempt fails every operation waiting on it.
    pub fn outgoing<N, T>(
        net: N,
        time: T,
        codec: C,
        destination: impl Into<String>,
        config: ConnectionConfig,
    ) -> Self
    where
        N: NetworkProvider + 'static,
        T: TimeProvider + 'static,
    {
        let destination = destination.into();
        let shared = Rc::new(RefCell::new(Shared {
            destination: destination.clone(),
            phase: Phase::Connecting,
            send_queue: VecDeque::new(),
        }));
        let pending = Rc::new(PendingReplies::new());
        let data_to_send = Rc::new(Notify::new());
        let ready_notify = Rc::new(Notify::new());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();

        let task = tokio::task::spawn_local(outbound_task(
            net,
            time,
            config,
            shared.clone(),
            pending.clone(),
            data_to_send.clone(),
            ready_notify.clone(),
            codec.clone(),
            inbound_tx.clone(),
            shutdown_rx,
        ));

        Self {
            shared,
            pending,
            data_to_send,
            ready_notify,
            next_id: Cell::new(0),
            codec,
            inbound_tx,
            inbound_rx: RefCell::new(Some(inbound_rx)),
            shutdown_tx,
            task: RefCell::new(Some(task)),
        }
    }

    /// Wrap an already-accepted inbound stream.
    ///
    /// Used by the server side of the transport. Starts established; when
    /// the stream drops the task exits instead of reconnecting.
    pub fn incoming<S>(stream: S, codec: C, peer_addr: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + 'static,
    {
        let shared = Rc::new(RefCell::new(Shared {
            destination: peer_addr.into(),
            phase: Phase::Established,
            send_queue: VecDeque::new(),
        }));
        let pending = Rc::new(PendingReplies::new());
        let data_to_send = Rc::new(Notify::new());
        let ready_notify = Rc::new(Notify::new());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();

        let task = tokio::task::spawn_local(run_connection(
            stream,
            shared.clone(),
            pending.clone(),
            data_to_send.clone(),
            ready_notify.clone(),
            codec.clone(),
            inbound_tx.clone(),
            shutdown_rx,
        ));

        Self {
            shared,
            pending,
            data_to_send,
            ready_notify,
            next_id: Cell::new(0),
            codec,
            inbound_tx,
            inbound_rx: RefCell::new(Some(inbound_rx)),
            shutdown_tx,
            task: RefCell::new(Some(task)),
        }
    }

    /// Address of the remote peer.
    pub fn destination(&self) -> String {
        self.shared.borrow().destination.clone()
    }

    /// Whether the channel is currently established.
    pub fn is_established(&self) -> bool {
        matches!(self.shared.borrow().phase, Phase::Established)
    }

    /// Whether the channel has failed permanently.
    pub fn is_failed(&self) -> bool {
        matches!(self.shared.borrow().phase, Phase::Failed(_))
    }

    /// Whether the channel was closed locally.
    pub fn is_closed(&self) -> bool {
        matches!(self.shared.borrow().phase, Phase::Closed)
    }

    /// Wait for establishment to finish.
    ///
    /// Resolves `Ok` once the channel is up, or with the establishment
    /// error shared by every waiter on this attempt.
    pub async fn ready(&self) -> Result<(), ConnectionError> {
        loop {
            let notified = self.ready_notify.notified();
            tokio::pin!(notified);
            // Register before re-checking the phase so a wakeup between the
            // check and the await cannot be lost.
            notified.as_mut().enable();
            {
                let shared = self.shared.borrow();
                match &shared.phase {
                    Phase::Established => return Ok(()),
                    Phase::Failed(error) => return Err(error.clone()),
                    Phase::Closed => return Err(ConnectionError::Closed),
                    Phase::Connecting => {}
                }
            }
            notified.await;
        }
    }

    /// Wait until the channel is failed or closed.
    ///
    /// Used by server-side consumers to stop reading inbound calls once
    /// the peer is gone.
    pub async fn closed(&self) {
        loop {
            let notified = self.ready_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if matches!(
                self.shared.borrow().phase,
                Phase::Failed(_) | Phase::Closed
            ) {
                return;
            }
            notified.await;
        }
    }

    /// Allocate a fresh message id.
    ///
    /// Monotonically increasing, wrapping on overflow; never returns an id
    /// that still has a pending entry on this connection.
    pub fn next_message_id(&self) -> u32 {
        let mut id = self.next_id.get();
        loop {
            id = id.wrapping_add(1);
            if id != 0 && !self.pending.contains(id) {
                break;
            }
        }
        self.next_id.set(id);
        id
    }

    /// Insert an unresolved pending entry for `id`.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateMessageId` if `id` is already pending, which
    /// indicates an id-allocation defect.
    pub fn register_reply(&self, id: u32) -> Result<ReplyReceiver, CallError> {
        self.pending.register(id)
    }

    /// Evict the pending entry for `id` without resolving it.
    ///
    /// Returns whether an entry existed. Called when a deadline elapses so
    /// a late reply cannot resolve an abandoned caller.
    pub fn discard_pending(&self, id: u32) -> bool {
        self.pending.discard(id)
    }

    /// Number of requests currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of replies that arrived with no matching pending entry.
    pub fn unsolicited_replies(&self) -> u64 {
        self.pending.unsolicited_count()
    }

    /// Queue an envelope for transmission.
    ///
    /// Returns without waiting for the write; the background writer drains
    /// the queue once the channel is up. Fails immediately if the channel
    /// already failed or was closed.
    ///
    /// # Errors
    ///
    /// Returns a connection error for a dead channel, or an encode error
    /// if the envelope cannot be serialized.
    pub fn send(&self, envelope: &Envelope) -> Result<(), CallError> {
        {
            let shared = self.shared.borrow();
            match &shared.phase {
                Phase::Failed(error) => return Err(error.clone().into()),
                Phase::Closed => return Err(ConnectionError::Closed.into()),
                Phase::Connecting | Phase::Established => {}
            }
        }

        let payload = self.codec.encode(envelope).map_err(|e| CallError::Encode {
            message: e.to_string(),
        })?;
        let packet = frame::encode_frame(&payload).map_err(|e| CallError::Encode {
            message: e.to_string(),
        })?;

        let mut shared = self.shared.borrow_mut();
        let first_unsent = shared.send_queue.is_empty();
        shared.send_queue.push_back(packet);
        drop(shared);

        if first_unsent {
            self.data_to_send.notify_one();
        }
        Ok(())
    }

    /// Hand an inbound envelope to this connection.
    ///
    /// Responses resolve their pending entry by id; an unmatched response
    /// is counted and dropped, never raised. Calls are forwarded to the
    /// inbound channel for a server-side consumer.
    pub fn deliver(&self, envelope: Envelope) {
        route_envelope(&self.pending, &self.inbound_tx, envelope);
    }

    /// Take ownership of the inbound call channel.
    ///
    /// Returns `None` if it was already taken. The server side consumes
    /// this to dispatch call envelopes to its handler.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        self.inbound_rx.borrow_mut().take()
    }

    /// Shut the connection down.
    ///
    /// Stops the background task, clears the send queue, and fails every
    /// pending request with [`ConnectionError::Closed`].
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(());
        let task = self.task.borrow_mut().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        {
            let mut shared = self.shared.borrow_mut();
            if !matches!(shared.phase, Phase::Failed(_)) {
                shared.phase = Phase::Closed;
            }
            shared.send_queue.clear();
        }
        self.pending.fail_all(ConnectionError::Closed);
        self.ready_notify.notify_waiters();
    }
}

/// Mark the connection failed and resolve everything waiting on it.
fn fail_connection(
    shared: &Rc<RefCell<Shared>>,
    pending: &PendingReplies,
    ready_notify: &Notify,
    error: ConnectionError,
) {
    {
        let mut shared = shared.borrow_mut();
        shared.phase = Phase::Failed(error.clone());
        shared.send_queue.clear();
    }
    pending.fail_all(error);
    ready_notify.notify_waiters();
}

/// Route one decoded inbound envelope.
///
/// Correlation is purely by message id, never by arrival order.
fn route_envelope(
    pending: &PendingReplies,
    inbound_tx: &mpsc::UnboundedSender<Envelope>,
    envelope: Envelope,
) {
    if envelope.is_response() {
        let id = envelope.id;
        if !pending.resolve(id, Ok(envelope)) {
            // Late or bogus reply: observe and drop, the connection stays
            // healthy.
            pending.record_unsolicited();
            tracing::debug!(id, "dropping reply with no pending entry");
        }
    } else {
        // Inbound call; a server-side consumer reads these. Client-side
        // connections have no consumer and the envelope is dropped when
        // the channel closes.
        let _ = inbound_tx.send(envelope);
    }
}

/// Establish the outbound channel, then run it.
#[allow(clippy::too_many_arguments)]
async fn outbound_task<N, T, C>(
    net: N,
    time: T,
    config: ConnectionConfig,
    shared: Rc<RefCell<Shared>>,
    pending: Rc<PendingReplies>,
    data_to_send: Rc<Notify>,
    ready_notify: Rc<Notify>,
    codec: C,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    shutdown_rx: mpsc::UnboundedReceiver<()>,
) where
    N: NetworkProvider + 'static,
    T: TimeProvider + 'static,
    C: MessageCodec,
{
    let destination = shared.borrow().destination.clone();

    let stream = match time
        .timeout(config.connect_timeout, net.connect(&destination))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            tracing::warn!(%destination, %error, "connection attempt failed");
            fail_connection(
                &shared,
                &pending,
                &ready_notify,
                ConnectionError::EstablishFailed { addr: destination },
            );
            return;
        }
        Err(_) => {
            tracing::warn!(%destination, "connection attempt timed out");
            fail_connection(
                &shared,
                &pending,
                &ready_notify,
                ConnectionError::EstablishFailed { addr: destination },
            );
            return;
        }
    };

    tracing::debug!(%destination, "connection established");
    shared.borrow_mut().phase = Phase::Established;
    ready_notify.notify_waiters();
    // Flush anything queued while we were connecting.
    data_to_send.notify_one();

    run_connection(
        stream,
        shared,
        pending,
        data_to_send,
        ready_notify,
        codec,
        inbound_tx,
        shutdown_rx,
    )
    .await;
}

/// Background task owning the stream: drains the send queue and parses
/// inbound frames. Exits on shutdown or channel failure.
#[allow(clippy::too_many_arguments)]
async fn run_connection<S, C>(
    mut stream: S,
    shared: Rc<RefCell<Shared>>,
    pending: Rc<PendingReplies>,
    data_to_send: Rc<Notify>,
    ready_notify: Rc<Notify>,
    codec: C,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
    C: MessageCodec,
{
    // Buffer for accumulating partial frame reads.
    let mut read_buffer: Vec<u8> = Vec::with_capacity(4096);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                break;
            }

            _ = data_to_send.notified() => {
                loop {
                    let next = shared.borrow_mut().send_queue.pop_front();
                    let Some(data) = next else { break };

                    // No shared-state borrow is held across the write.
                    if let Err(error) = stream.write_all(&data).await {
                        tracing::debug!(%error, "write failed");
                        fail_connection(&shared, &pending, &ready_notify, error.into());
                        return;
                    }
                }
            }

            read_result = async {
                let mut buf = vec![0u8; 4096];
                stream.read(&mut buf).await.map(|n| (buf, n))
            } => {
                match read_result {
                    Ok((_, 0)) => {
                        // Peer closed the channel.
                        fail_connection(
                            &shared,
                            &pending,
                            &ready_notify,
                            ConnectionError::ConnectionLost,
                        );
                        return;
                    }
                    Ok((buf, n)) => {
                        read_buffer.extend_from_slice(&buf[..n]);
                        if !drain_read_buffer(
                            &mut read_buffer,
                            &codec,
                            &pending,
                            &inbound_tx,
                        ) {
                            fail_connection(
                                &shared,
                                &pending,
                                &ready_notify,
                                ConnectionError::ConnectionLost,
                            );
                            return;
                        }
                    }
                    Err(error) => {
                        tracing::debug!(%error, "read failed");
                        fail_connection(&shared, &pending, &ready_notify, error.into());
                        return;
                    }
                }
            }
        }
    }
}

/// Parse every complete frame in the buffer and route its envelope.
///
/// Returns `false` if the stream is corrupt and the connection must be
/// torn down.
fn drain_read_buffer<C: MessageCodec>(
    read_buffer: &mut Vec<u8>,
    codec: &C,
    pending: &PendingReplies,
    inbound_tx: &mpsc::UnboundedSender<Envelope>,
) -> bool {
    loop {
        match frame::try_decode_frame(read_buffer) {
            Ok(Some((payload, consumed))) => {
                read_buffer.drain(..consumed);
                match codec.decode::<Envelope>(&payload) {
                    Ok(envelope) => route_envelope(pending, inbound_tx, envelope),
                    Err(error) => {
                        // Undecodable payload carries no usable id; drop it.
                        tracing::warn!(%error, "failed to decode envelope");
                    }
                }
            }
            Ok(None) => return true,
            Err(error) => {
                tracing::warn!(%error, "wire format error, tearing down connection");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::envelope::MessageKind;
    use crate::frame::encode_frame;

    fn run_local<F: std::future::Future<Output = ()>>(f: F) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        tokio::task::LocalSet::new().block_on(&rt, f);
    }

    fn frame_envelope(envelope: &Envelope) -> Vec<u8> {
        let payload = JsonCodec.encode(envelope).expect("encode");
        encode_frame(&payload).expect("frame")
    }

    async fn read_one_envelope<S: AsyncRead + Unpin>(stream: &mut S) -> Envelope {
        let mut buf = Vec::new();
        loop {
            let mut chunk = vec![0u8; 1024];
            let n = stream.read(&mut chunk).await.expect("read");
            assert!(n > 0, "stream closed early");
            buf.extend_from_slice(&chunk[..n]);
            if let Some((payload, consumed)) =
                frame::try_decode_frame(&buf).expect("decode frame")
            {
                buf.drain(..consumed);
                return JsonCodec.decode(&payload).expect("decode envelope");
            }
        }
    }

    #[test]
    fn test_message_ids_increase_and_skip_pending() {
        run_local(async {
            let (local, _remote) = tokio::io::duplex(4096);
            let conn = Connection::incoming(local, JsonCodec, "peer");

            let first = conn.next_message_id();
            let second = conn.next_message_id();
            assert_eq!(first, 1);
            assert_eq!(second, 2);

            // Ids with a pending entry are never handed out again, even
            // across counter wraparound.
            let _rx = conn.register_reply(3).expect("register");
            conn.next_id.set(2);
            assert_eq!(conn.next_message_id(), 4);
        });
    }

    #[test]
    fn test_send_writes_frame_to_stream() {
        run_local(async {
            let (local, mut remote) = tokio::io::duplex(4096);
            let conn = Connection::incoming(local, JsonCodec, "peer");

            let envelope = Envelope::call(1, "Echo", vec![b"ping".to_vec()]);
            conn.send(&envelope).expect("send");

            let received = read_one_envelope(&mut remote).await;
            assert_eq!(received, envelope);
        });
    }

    #[test]
    fn test_inbound_reply_resolves_pending_entry() {
        run_local(async {
            let (local, mut remote) = tokio::io::duplex(4096);
            let conn = Connection::incoming(local, JsonCodec, "peer");

            let rx = conn.register_reply(9).expect("register");
            let reply = Envelope::reply(9, "Echo", vec![b"pong".to_vec()]);
            remote
                .write_all(&frame_envelope(&reply))
                .await
                .expect("write");

            let resolved = rx.await.expect("resolved").expect("ok");
            assert_eq!(resolved, reply);
            assert_eq!(conn.pending_count(), 0);
        });
    }

    #[test]
    fn test_replies_resolve_by_id_not_arrival_order() {
        run_local(async {
            let (local, mut remote) = tokio::io::duplex(4096);
            let conn = Connection::incoming(local, JsonCodec, "peer");

            let rx1 = conn.register_reply(1).expect("register");
            let rx2 = conn.register_reply(2).expect("register");

            // The second request's reply arrives first.
            let reply_two = Envelope::reply(2, "svc", vec![b"two".to_vec()]);
            let reply_one = Envelope::reply(1, "svc", vec![b"one".to_vec()]);
            remote
                .write_all(&frame_envelope(&reply_two))
                .await
                .expect("write");
            remote
                .write_all(&frame_envelope(&reply_one))
                .await
                .expect("write");

            let two = rx2.await.expect("resolved").expect("ok");
            let one = rx1.await.expect("resolved").expect("ok");
            assert_eq!(two.args, vec![b"two".to_vec()]);
            assert_eq!(one.args, vec![b"one".to_vec()]);
        });
    }

    #[test]
    fn test_unmatched_reply_is_dropped_not_fatal() {
        run_local(async {
            let (local, mut remote) = tokio::io::duplex(4096);
            let conn = Connection::incoming(local, JsonCodec, "peer");

            let reply = Envelope::reply(42, "Echo", vec![b"late".to_vec()]);
            remote
                .write_all(&frame_envelope(&reply))
                .await
                .expect("write");

            // Give the reader a chance to process the frame.
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;

            assert_eq!(conn.unsolicited_replies(), 1);
            assert!(conn.is_established());
        });
    }

    #[test]
    fn test_peer_disconnect_fails_pending_requests() {
        run_local(async {
            let (local, remote) = tokio::io::duplex(4096);
            let conn = Connection::incoming(local, JsonCodec, "peer");

            let rx_a = conn.register_reply(1).expect("register");
            let rx_b = conn.register_reply(2).expect("register");

            drop(remote);

            let err_a = rx_a.await.expect("resolved").expect_err("failed");
            let err_b = rx_b.await.expect("resolved").expect_err("failed");
            assert_eq!(
                err_a,
                CallError::Connection(ConnectionError::ConnectionLost)
            );
            assert_eq!(err_a, err_b);
            assert!(conn.is_failed());
            assert_eq!(conn.pending_count(), 0);
        });
    }

    #[test]
    fn test_corrupt_frame_tears_down_connection() {
        run_local(async {
            let (local, mut remote) = tokio::io::duplex(4096);
            let conn = Connection::incoming(local, JsonCodec, "peer");

            let rx = conn.register_reply(1).expect("register");

            let mut bad = frame_envelope(&Envelope::reply(1, "Echo", vec![]));
            bad[frame::FRAME_HEADER_SIZE] ^= 0xFF;
            remote.write_all(&bad).await.expect("write");
            let err = rx.await.expect("resolved").expect_err("failed");
            assert_eq!(err, CallError::Connection(ConnectionError::ConnectionLost));
        });
    }

    #[test]
    fn test_deliver_routes_calls_to_inbound_channel() {
        run_local(async {
            let (local, _remote) = tokio::io::duplex(4096);
            let conn = Connection::incoming(local, JsonCodec, "peer");
            let mut inbound = conn.take_inbound().expect("inbound");

            conn.deliver(Envelope::call(5, "Svc", vec![b"arg".to_vec()]));
            let call = inbound.recv().await.expect("call");
            assert_eq!(call.id, 5);
            assert_eq!(call.kind, MessageKind::CallRequest);

            // Taking the channel twice is not possible.
            assert!(conn.take_inbound().is_none());
        });
    }

    #[test]
    fn test_write_failure_carries_io_detail() {
        use std::pin::Pin;
        use std::task::{Context, Poll};

        // Reads stay pending forever; every write fails.
        struct BrokenPipe;
        impl AsyncRead for BrokenPipe {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> Poll<std::io::Result<()>> {
                Poll::Pending
            }
        }
        impl AsyncWrite for BrokenPipe {
            fn poll_write(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &[u8],
            ) -> Poll<std::io::Result<usize>> {
                Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
            }
            fn poll_flush(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<std::io::Result<()>> {
                Poll::Ready(Ok(()))
            }
            fn poll_shutdown(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<std::io::Result<()>> {
                Poll::Ready(Ok(()))
            }
        }

        run_local(async {
            let conn = Connection::incoming(BrokenPipe, JsonCodec, "peer");

            let rx = conn.register_reply(1).expect("register");
            conn.send(&Envelope::call(1, "Svc", vec![])).expect("queue");

            let err = rx.await.expect("resolved").expect_err("failed");
            assert!(matches!(
                err,
                CallError::Connection(ConnectionError::Io(_))
            ));
            assert!(err.to_string().contains("broken pipe"));
            assert!(conn.is_failed());
        });
    }

    #[test]
    fn test_close_fails_pending_and_rejects_sends() {
        run_local(async {
            let (local, _remote) = tokio::io::duplex(4096);
            let conn = Connection::incoming(local, JsonCodec, "peer");

            let rx = conn.register_reply(1).expect("register");
            conn.close().await;

            let err = rx.await.expect("resolved").expect_err("failed");
            assert_eq!(err, CallError::Connection(ConnectionError::Closed));

            let result = conn.send(&Envelope::call(2, "Svc", vec![]));
            assert_eq!(
                result,
                Err(CallError::Connection(ConnectionError::Closed))
            );
        });
    }
}
