use async_trait::async_trait;
use thiserror::Error;
use url::Url;

pub mod handle;
pub mod mock;
pub mod websocket;

pub use handle::{ListenerGuard, OneShotListener, TransportHandle};

/// Coarse state of the one physical connection a handle owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: the reconnect budget is exhausted. A fresh `open()` is
    /// required to try again.
    Error,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("unable to reach {url}: {reason}")]
    ConnectFailed { url: String, reason: String },
    #[error("connect to {url} timed out after {seconds}s")]
    ConnectTimeout { url: String, seconds: u64 },
    #[error("transport is not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
}

/// Establishes one connection attempt. The production implementation dials
/// a WebSocket; tests inject an in-memory pair.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Conn>, TransportError>;
}

/// One live connection: text frames in, text frames out.
#[async_trait]
pub trait Conn: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Next inbound frame. `None` means the peer (or network) closed the
    /// connection.
    async fn recv(&mut self) -> Option<String>;

    async fn close(&mut self);
}
