//! Provider abstractions for networking and time.
//!
//! Trait-based seams that let the same connection logic run over real
//! Tokio networking or test doubles. Single-threaded design throughout,
//! so no `Send` bounds are needed.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Provider trait for creating network connections and listeners.
///
/// `Clone` allows sharing one provider across a registry and its
/// connections.
#[async_trait(?Send)]
pub trait NetworkProvider: Clone {
    /// The byte-stream type this provider produces.
    type Stream: AsyncRead + AsyncWrite + Unpin + 'static;
    /// The listener type this provider produces.
    type Listener: NetListener<Stream = Self::Stream> + 'static;

    /// Create a listener bound to the given address.
    async fn bind(&self, addr: &str) -> io::Result<Self::Listener>;

    /// Connect to a remote address.
    async fn connect(&self, addr: &str) -> io::Result<Self::Stream>;
}

/// Trait for listeners that accept inbound connections.
#[async_trait(?Send)]
pub trait NetListener {
    /// The byte-stream type this listener produces.
    type Stream: AsyncRead + AsyncWrite + Unpin + 'static;

    /// Accept a single inbound connection, returning the stream and the
    /// remote peer's address.
    async fn accept(&self) -> io::Result<(Self::Stream, String)>;

    /// The local address this listener is bound to.
    fn local_addr(&self) -> io::Result<String>;
}

/// Real networking via Tokio TCP.
#[derive(Debug, Clone, Default)]
pub struct TokioNetworkProvider;

impl TokioNetworkProvider {
    /// Create a new Tokio network provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl NetworkProvider for TokioNetworkProvider {
    type Stream = tokio::net::TcpStream;
    type Listener = TokioTcpListener;

    async fn bind(&self, addr: &str) -> io::Result<Self::Listener> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        Ok(TokioTcpListener { inner })
    }

    async fn connect(&self, addr: &str) -> io::Result<Self::Stream> {
        tokio::net::TcpStream::connect(addr).await
    }
}

/// Wrapper for the Tokio TCP listener.
#[derive(Debug)]
pub struct TokioTcpListener {
    inner: tokio::net::TcpListener,
}

#[async_trait(?Send)]
impl NetListener for TokioTcpListener {
    type Stream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::Stream, String)> {
        let (stream, addr) = self.inner.accept().await?;
        Ok((stream, addr.to_string()))
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}

/// Returned by [`TimeProvider::timeout`] when the deadline elapses first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline elapsed")]
pub struct Elapsed;

/// Provider trait for time operations.
#[async_trait(?Send)]
pub trait TimeProvider: Clone {
    /// Sleep for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Elapsed time since provider creation.
    fn now(&self) -> Duration;

    /// Run a future under a deadline.
    ///
    /// Returns `Ok(output)` if the future completes in time, or
    /// `Err(Elapsed)` if the deadline passes first.
    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, Elapsed>
    where
        F: std::future::Future<Output = T>;
}

/// Real time via Tokio's timer facilities.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start: std::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, Elapsed>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(duration, future)
            .await
            .map_err(|_| Elapsed)
    }
}
