//! Per-connection read loop.
//!
//! Decodes inbound frames, answers PING, dispatches to registered handlers
//! and, once the socket is gone, routes the removal back through the actor
//! before running the disconnect hook exactly once.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, warn};
use wsbroker_common::{
    protocol::{decode_event_bytes, encode_event, SocketEvent, SystemEvent},
    types::ConnectionInfo,
};

use super::{
    actor::{self, Request},
    callbacks::{CallbackRegistry, IncomingEvent},
    connection::{advance_state, CloseReason, ConnectionState, StateSender},
    supervisor::panic_message,
};
use crate::{
    error::DecodeError,
    metrics,
    transport::{Frame, FrameSource},
};

/// Runs after a connection has left the registry.
#[async_trait]
pub trait DisconnectHook: Send + Sync + 'static {
    async fn on_disconnect(&self, connection: ConnectionInfo, reason: CloseReason);
}

#[async_trait]
impl<F, Fut> DisconnectHook for F
where
    F: Fn(ConnectionInfo, CloseReason) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    async fn on_disconnect(&self, connection: ConnectionInfo, reason: CloseReason) {
        (self)(connection, reason).await;
    }
}

pub(crate) fn decode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<SocketEvent, DecodeError> {
    if payload.len() > max_frame_bytes {
        return Err(DecodeError::TooLarge { size: payload.len(), max: max_frame_bytes });
    }
    Ok(decode_event_bytes(payload)?)
}

pub(crate) struct ReaderTask {
    pub(crate) info: ConnectionInfo,
    pub(crate) source: Box<dyn FrameSource>,
    pub(crate) shutdown: oneshot::Receiver<CloseReason>,
    pub(crate) state: StateSender,
    pub(crate) requests: mpsc::WeakSender<Request>,
    pub(crate) callbacks: Arc<CallbackRegistry>,
    pub(crate) disconnect_hook: Option<Arc<dyn DisconnectHook>>,
    pub(crate) max_frame_bytes: usize,
    pub(crate) respond_to_ping: bool,
    pub(crate) request_timeout: Option<Duration>,
}

enum Exit {
    /// The actor already removed the connection.
    Removed(CloseReason),
    /// The socket went away on its own.
    Lost(CloseReason),
}

pub(crate) fn spawn(task: ReaderTask) -> JoinHandle<()> {
    tokio::spawn(task.run())
}

impl ReaderTask {
    async fn run(mut self) {
        let reason = match self.read_loop().await {
            Exit::Removed(reason) => reason,
            Exit::Lost(reason) => {
                advance_state(&self.state, ConnectionState::Closing);
                self.request_removal(reason).await;
                reason
            }
        };

        self.run_disconnect_hook(reason).await;
        advance_state(&self.state, ConnectionState::Closed);
        debug!(
            user_id = self.info.user_id,
            connection_id = %self.info.connection_id,
            reason = reason.as_str(),
            "reader task finished"
        );
    }

    async fn read_loop(&mut self) -> Exit {
        let mut orphaned = false;
        loop {
            let frame = if orphaned {
                self.source.next_frame().await
            } else {
                tokio::select! {
                    signal = &mut self.shutdown => match signal {
                        Ok(reason) => return Exit::Removed(reason),
                        Err(_) => {
                            warn!(
                                user_id = self.info.user_id,
                                connection_id = %self.info.connection_id,
                                "connection orphaned by broker restart; continuing to read"
                            );
                            orphaned = true;
                            continue;
                        }
                    },
                    frame = self.source.next_frame() => frame,
                }
            };

            match frame {
                None | Some(Ok(Frame::Close)) => return Exit::Lost(CloseReason::ClientClosed),
                Some(Err(error)) => {
                    debug!(connection_id = %self.info.connection_id, error = %error, "socket read failed");
                    return Exit::Lost(CloseReason::ReadFailed);
                }
                Some(Ok(Frame::Control)) => {}
                Some(Ok(Frame::Text(text))) => self.handle_payload(text.as_bytes()).await,
                Some(Ok(Frame::Binary(bytes))) => self.handle_payload(&bytes).await,
            }
        }
    }

    async fn handle_payload(&mut self, payload: &[u8]) {
        let event = match decode_frame(payload, self.max_frame_bytes) {
            Ok(event) => event,
            Err(error) => {
                metrics::increment_decode_errors();
                warn!(
                    user_id = self.info.user_id,
                    connection_id = %self.info.connection_id,
                    error = %error,
                    "dropping undecodable frame"
                );
                return;
            }
        };

        if self.respond_to_ping && event.system_event() == Some(SystemEvent::Ping) {
            self.reply_pong().await;
        }

        self.callbacks
            .dispatch(IncomingEvent {
                user_id: self.info.user_id,
                event,
                connection_id: self.info.connection_id,
            })
            .await;
    }

    async fn reply_pong(&mut self) {
        let Some(requests) = self.requests.upgrade() else {
            return;
        };
        let payload = match encode_event(&SystemEvent::Pong.event(Value::Null)) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(error = %error, "failed to encode PONG event");
                return;
            }
        };

        let connection_id = self.info.connection_id;
        let result = actor::call(
            &requests,
            |reply| Request::SendToConnection { connection_id, payload, reply },
            self.request_timeout,
        )
        .await;
        if let Err(error) = result {
            debug!(connection_id = %connection_id, error = %error, "PONG not delivered");
        }
    }

    async fn request_removal(&mut self, reason: CloseReason) {
        let Some(requests) = self.requests.upgrade() else {
            debug!(connection_id = %self.info.connection_id, "broker gone; skipping removal request");
            return;
        };

        let connection_id = self.info.connection_id;
        let result = actor::call(
            &requests,
            |reply| Request::Disconnect { connection_id, reason, reply },
            self.request_timeout,
        )
        .await;
        match result {
            Ok(true) => {}
            Ok(false) => debug!(connection_id = %connection_id, "connection was already removed"),
            Err(error) => warn!(connection_id = %connection_id, error = %error, "removal request failed"),
        }
    }

    async fn run_disconnect_hook(&mut self, reason: CloseReason) {
        let Some(hook) = &self.disconnect_hook else {
            return;
        };

        let outcome = AssertUnwindSafe(hook.on_disconnect(self.info.clone(), reason))
            .catch_unwind()
            .await;
        if let Err(payload) = outcome {
            error!(
                connection_id = %self.info.connection_id,
                panic = %panic_message(payload.as_ref()),
                "disconnect hook panicked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_frames_are_rejected_before_parsing() {
        let payload = br#"{"event_key":1,"event_name":"X","data":"0123456789"}"#;

        assert!(matches!(
            decode_frame(payload, 8),
            Err(DecodeError::TooLarge { max: 8, .. })
        ));
        assert_eq!(decode_frame(payload, 1024).expect("frame should decode").event_name, "X");
    }

    #[test]
    fn malformed_frames_surface_as_decode_errors() {
        assert!(matches!(decode_frame(b"not json", 1024), Err(DecodeError::Malformed(_))));
    }
}
