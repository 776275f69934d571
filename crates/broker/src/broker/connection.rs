use std::{sync::Arc, time::Duration};

use tokio::sync::{oneshot, watch};
use uuid::Uuid;
use wsbroker_common::types::{ConnectionInfo, UserId};

use crate::transport::{FrameSink, TransportError};

/// Lifecycle of a single connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A write from the actor loop failed or timed out.
    WriteFailed,
    /// A heartbeat ping could not be written.
    HeartbeatFailed,
    /// The peer sent a close frame or its stream ended.
    ClientClosed,
    /// The blocking read returned an error.
    ReadFailed,
    /// A collaborator asked for the connection to be closed.
    Requested,
    /// The broker itself is shutting down.
    Shutdown,
}

impl CloseReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WriteFailed => "write_failed",
            Self::HeartbeatFailed => "heartbeat_failed",
            Self::ClientClosed => "client_closed",
            Self::ReadFailed => "read_failed",
            Self::Requested => "requested",
            Self::Shutdown => "shutdown",
        }
    }
}

pub(crate) type StateSender = Arc<watch::Sender<ConnectionState>>;

pub(crate) fn advance_state(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    state.send_if_modified(|current| {
        if *current < next {
            *current = next;
            true
        } else {
            false
        }
    });
}

/// Registry-owned half of a live connection.
pub(crate) struct Connection {
    info: ConnectionInfo,
    sink: Box<dyn FrameSink>,
    state: StateSender,
    shutdown: Option<oneshot::Sender<CloseReason>>,
}

impl Connection {
    pub(crate) fn new(
        info: ConnectionInfo,
        sink: Box<dyn FrameSink>,
        state: StateSender,
        shutdown: oneshot::Sender<CloseReason>,
    ) -> Self {
        Self { info, sink, state, shutdown: Some(shutdown) }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.info.connection_id
    }

    pub(crate) fn user_id(&self) -> UserId {
        self.info.user_id
    }

    pub(crate) fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub(crate) fn info_mut(&mut self) -> &mut ConnectionInfo {
        &mut self.info
    }

    pub(crate) async fn write(&mut self, text: &str, limit: Duration) -> Result<(), TransportError> {
        match tokio::time::timeout(limit, self.sink.send_text(text.to_owned())).await {
            Ok(result) => result,
            Err(_) => Err(timed_out(limit)),
        }
    }

    pub(crate) async fn ping(&mut self, limit: Duration) -> Result<(), TransportError> {
        match tokio::time::timeout(limit, self.sink.send_ping()).await {
            Ok(result) => result,
            Err(_) => Err(timed_out(limit)),
        }
    }

    /// Closes the write half and tells the reader task to stop.
    pub(crate) async fn close(mut self, reason: CloseReason, limit: Duration) {
        advance_state(&self.state, ConnectionState::Closing);
        let _ = tokio::time::timeout(limit, self.sink.close()).await;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(reason);
        }
    }
}

fn timed_out(limit: Duration) -> TransportError {
    TransportError::Send(format!("write timed out after {}ms", limit.as_millis()))
}

/// Caller-facing view of a registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    info: ConnectionInfo,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub(crate) fn new(info: ConnectionInfo, state: watch::Receiver<ConnectionState>) -> Self {
        Self { info, state }
    }

    pub fn connection_id(&self) -> Uuid {
        self.info.connection_id
    }

    pub fn user_id(&self) -> UserId {
        self.info.user_id
    }

    /// Metadata as of registration.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Resolves once the connection reached `Closed` and its disconnect hook ran.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|current| *current == ConnectionState::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_never_moves_backwards() {
        let (sender, receiver) = watch::channel(ConnectionState::Connecting);

        advance_state(&sender, ConnectionState::Closing);
        advance_state(&sender, ConnectionState::Open);
        assert_eq!(*receiver.borrow(), ConnectionState::Closing);

        advance_state(&sender, ConnectionState::Closed);
        assert_eq!(*receiver.borrow(), ConnectionState::Closed);
    }

    #[test]
    fn close_reasons_have_stable_labels() {
        assert_eq!(CloseReason::WriteFailed.as_str(), "write_failed");
        assert_eq!(CloseReason::ClientClosed.as_str(), "client_closed");
        assert_eq!(CloseReason::Requested.as_str(), "requested");
    }
}
