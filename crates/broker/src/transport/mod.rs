//! Transport seam between the broker and a concrete push socket.
//!
//! The broker never touches axum types directly. An upgrade produces an
//! [`UpgradedSocket`]: the write half is owned by the actor loop, the read
//! half by the connection's reader task.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use thiserror::Error;

/// One inbound transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Ping/pong traffic; answered by the transport itself.
    Control,
    Close,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket upgrade failed: {0}")]
    Upgrade(String),

    #[error("socket is closed")]
    Closed,

    #[error("socket send failed: {0}")]
    Send(String),

    #[error("socket receive failed: {0}")]
    Receive(String),
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Best-effort close; errors are swallowed because the socket is being dropped anyway.
    async fn close(&mut self);
}

/// Read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the peer has gone away.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// Peer metadata captured at upgrade time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteInfo {
    pub remote_addr: Option<String>,
    pub subprotocol: Option<String>,
    pub network: String,
}

impl RemoteInfo {
    pub fn tcp(remote_addr: impl Into<String>, subprotocol: Option<String>) -> Self {
        Self { remote_addr: Some(remote_addr.into()), subprotocol, network: "tcp".to_string() }
    }
}

/// A freshly upgraded connection, split into independently owned halves.
pub struct UpgradedSocket {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
    pub remote: RemoteInfo,
}

impl UpgradedSocket {
    pub fn new(
        sink: impl FrameSink + 'static,
        source: impl FrameSource + 'static,
        remote: RemoteInfo,
    ) -> Self {
        Self { sink: Box::new(sink), source: Box::new(source), remote }
    }
}

impl std::fmt::Debug for UpgradedSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradedSocket").field("remote", &self.remote).finish_non_exhaustive()
    }
}
