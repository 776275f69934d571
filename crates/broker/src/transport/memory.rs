//! In-process socket pair.
//!
//! The server half plugs into the broker like any upgraded socket; the
//! [`MemoryPeer`] half plays the client. Used by the test suites and by
//! embedders that want to drive the broker without a network.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use wsbroker_common::protocol::{decode_event, encode_event, SocketEvent};

use super::{Frame, FrameSink, FrameSource, RemoteInfo, TransportError, UpgradedSocket};

#[derive(Debug, Default)]
struct PeerState {
    fail_writes: AtomicBool,
    closed_by_server: AtomicBool,
    pings: AtomicUsize,
}

struct MemorySink {
    outbound: mpsc::UnboundedSender<String>,
    state: Arc<PeerState>,
}

struct MemorySource {
    inbound: mpsc::UnboundedReceiver<Frame>,
}

/// Client half of an in-memory connection.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Frame>>,
    outbound: mpsc::UnboundedReceiver<String>,
    state: Arc<PeerState>,
}

/// Creates a connected pair with `network = "memory"` and no remote address.
pub fn socket_pair() -> (UpgradedSocket, MemoryPeer) {
    pair(RemoteInfo { remote_addr: None, subprotocol: None, network: "memory".to_string() })
}

pub fn pair(remote: RemoteInfo) -> (UpgradedSocket, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let state = Arc::new(PeerState::default());

    let socket = UpgradedSocket::new(
        MemorySink { outbound: outbound_tx, state: Arc::clone(&state) },
        MemorySource { inbound: inbound_rx },
        remote,
    );
    let peer = MemoryPeer { inbound: Some(inbound_tx), outbound: outbound_rx, state };
    (socket, peer)
}

impl MemorySink {
    fn check_writable(&self) -> Result<(), TransportError> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Send("injected write failure".to_string()));
        }
        if self.state.closed_by_server.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.check_writable()?;
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.check_writable()?;
        if self.outbound.is_closed() {
            return Err(TransportError::Closed);
        }
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        self.state.closed_by_server.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }
}

impl MemoryPeer {
    pub fn send_event(&self, event: &SocketEvent) -> bool {
        match encode_event(event) {
            Ok(encoded) => self.send_frame(Frame::Text(encoded)),
            Err(_) => false,
        }
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send_frame(Frame::Text(text.into()))
    }

    pub fn send_frame(&self, frame: Frame) -> bool {
        self.inbound.as_ref().is_some_and(|inbound| inbound.send(frame).is_ok())
    }

    /// Simulates the client going away: the server's next read returns `None`.
    pub fn disconnect(&mut self) {
        self.inbound.take();
    }

    /// Every subsequent server write to this peer fails.
    pub fn fail_writes(&self) {
        self.state.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn is_closed_by_server(&self) -> bool {
        self.state.closed_by_server.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// Next raw text frame written by the server.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Next decodable event written by the server.
    pub async fn recv_event(&mut self) -> Option<SocketEvent> {
        while let Some(text) = self.outbound.recv().await {
            if let Ok(event) = decode_event(&text) {
                return Some(event);
            }
        }
        None
    }

    /// Events already written by the server, without waiting.
    pub fn drain_events(&mut self) -> Vec<SocketEvent> {
        let mut events = Vec::new();
        while let Ok(text) = self.outbound.try_recv() {
            if let Ok(event) = decode_event(&text) {
                events.push(event);
            }
        }
        events
    }
}
