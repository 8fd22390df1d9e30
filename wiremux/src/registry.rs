//! Peer registry: at most one connection per remote address.
//!
//! Lookups are synchronous. A new entry is inserted into the map before
//! the function returns, and establishment runs in the connection's
//! background task, so two tasks resolving the same address always share
//! one connection no matter how their establishment interleaves.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::codec::MessageCodec;
use crate::connection::{Connection, ConnectionConfig};
use crate::error::CallError;
use crate::providers::{NetworkProvider, TimeProvider};

/// Shared map from peer address to its single live connection.
pub struct PeerRegistry<N, T, C>
where
    N: NetworkProvider + 'static,
    T: TimeProvider + 'static,
    C: MessageCodec,
{
    net: N,
    time: T,
    codec: C,
    config: ConnectionConfig,
    peers: RefCell<HashMap<String, Rc<Connection<C>>>>,
}

impl<N, T, C> PeerRegistry<N, T, C>
where
    N: NetworkProvider + 'static,
    T: TimeProvider + 'static,
    C: MessageCodec,
{
    /// Create an empty registry over the given providers.
    pub fn new(net: N, time: T, codec: C, config: ConnectionConfig) -> Self {
        Self {
            net,
            time,
            codec,
            config,
            peers: RefCell::new(HashMap::new()),
        }
    }

    /// Return the connection for `addr`, creating it if absent.
    ///
    /// An entry that failed since the last lookup is evicted and replaced
    /// with a fresh connection attempt. The returned connection may still
    /// be establishing; callers wait via [`Connection::ready`] or simply
    /// queue sends.
    pub fn resolve(&self, addr: &str) -> Rc<Connection<C>> {
        let mut peers = self.peers.borrow_mut();

        if let Some(conn) = peers.get(addr) {
            if !conn.is_failed() && !conn.is_closed() {
                return conn.clone();
            }
            tracing::debug!(%addr, "evicting dead connection");
            peers.remove(addr);
        }

        tracing::debug!(%addr, "opening connection");
        let conn = Rc::new(Connection::outgoing(
            self.net.clone(),
            self.time.clone(),
            self.codec.clone(),
            addr,
            self.config.clone(),
        ));
        peers.insert(addr.to_string(), conn.clone());
        conn
    }

    /// Connection settings this registry opens peers with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Look up the connection for `addr` without creating one.
    pub fn get(&self, addr: &str) -> Option<Rc<Connection<C>>> {
        self.peers.borrow().get(addr).cloned()
    }

    /// Remove the entry for `addr`, returning it if present.
    ///
    /// The connection itself is not shut down; the caller decides whether
    /// to close it or let in-flight requests drain.
    pub fn remove(&self, addr: &str) -> Option<Rc<Connection<C>>> {
        self.peers.borrow_mut().remove(addr)
    }

    /// Number of registered peers, failed entries included.
    pub fn len(&self) -> usize {
        self.peers.borrow().len()
    }

    /// Whether the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.peers.borrow().is_empty()
    }

    /// Close every connection and clear the registry.
    pub async fn close_all(&self) {
        let peers = std::mem::take(&mut *self.peers.borrow_mut());
        for (addr, conn) in peers {
            tracing::debug!(%addr, "closing connection");
            conn.close().await;
        }
    }

    /// Prepare a one-off request against the peer at `addr`.
    ///
    /// Convenience for callers without an [`RpcClient`](crate::RpcClient);
    /// the request uses this registry's default deadline and no trace hook.
    pub fn request(&self, addr: &str) -> PeerRequest<'_, N, T, C> {
        PeerRequest {
            registry: self,
            addr: addr.to_string(),
        }
    }
}

/// One prepared request against a peer, issued with [`send`](Self::send).
pub struct PeerRequest<'a, N, T, C>
where
    N: NetworkProvider + 'static,
    T: TimeProvider + 'static,
    C: MessageCodec,
{
    registry: &'a PeerRegistry<N, T, C>,
    addr: String,
}

impl<N, T, C> PeerRequest<'_, N, T, C>
where
    N: NetworkProvider + 'static,
    T: TimeProvider + 'static,
    C: MessageCodec,
{
    /// Call `service` on the prepared peer and wait for the reply.
    ///
    /// # Errors
    ///
    /// Connection, timeout, and remote errors, as for
    /// [`RpcClient::call`](crate::RpcClient::call).
    pub async fn send(
        &self,
        service: &str,
        args: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, CallError> {
        let conn = self.registry.resolve(&self.addr);
        conn.ready().await?;
        let deadline = self.registry.config.request_timeout;
        let reply = crate::client::call_on(
            &conn,
            &self.registry.time,
            None,
            service,
            args,
            deadline,
        )
        .await?;
        crate::client::unwrap_reply(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::providers::{TokioNetworkProvider, TokioTimeProvider};

    fn run_local<F: std::future::Future<Output = ()>>(f: F) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        tokio::task::LocalSet::new().block_on(&rt, f);
    }

    fn registry() -> PeerRegistry<TokioNetworkProvider, TokioTimeProvider, JsonCodec> {
        PeerRegistry::new(
            TokioNetworkProvider::new(),
            TokioTimeProvider::new(),
            JsonCodec,
            ConnectionConfig::default(),
        )
    }

    #[test]
    fn test_resolve_returns_same_connection_while_establishing() {
        run_local(async {
            let registry = registry();

            // Establishment has not finished; both lookups must share the
            // connection created by the first.
            let a = registry.resolve("10.0.0.1:9000");
            let b = registry.resolve("10.0.0.1:9000");
            assert!(Rc::ptr_eq(&a, &b));
            assert_eq!(registry.len(), 1);
        });
    }

    #[test]
    fn test_distinct_addresses_get_distinct_connections() {
        run_local(async {
            let registry = registry();

            let a = registry.resolve("10.0.0.1:9000");
            let b = registry.resolve("10.0.0.2:9000");
            assert!(!Rc::ptr_eq(&a, &b));
            assert_eq!(registry.len(), 2);
        });
    }

    #[test]
    fn test_failed_entry_is_replaced_on_next_resolve() {
        run_local(async {
            let registry = registry();

            // Port 1 on loopback refuses connections.
            let first = registry.resolve("127.0.0.1:1");
            first.ready().await.expect_err("establishment fails");
            assert!(first.is_failed());

            let second = registry.resolve("127.0.0.1:1");
            assert!(!Rc::ptr_eq(&first, &second));
            assert_eq!(registry.len(), 1);
        });
    }

    #[test]
    fn test_remove_drops_entry_without_closing() {
        run_local(async {
            let registry = registry();

            let conn = registry.resolve("10.0.0.1:9000");
            let removed = registry.remove("10.0.0.1:9000").expect("present");
            assert!(Rc::ptr_eq(&conn, &removed));
            assert!(registry.is_empty());
            assert!(registry.get("10.0.0.1:9000").is_none());
        });
    }

    #[test]
    fn test_close_all_clears_registry() {
        run_local(async {
            let registry = registry();
            registry.resolve("10.0.0.1:9000");
            registry.resolve("10.0.0.2:9000");

            registry.close_all().await;
            assert!(registry.is_empty());
        });
    }
}
