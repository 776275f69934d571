// axum WebSocket adapter for the transport seam.

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};

use super::{Frame, FrameSink, FrameSource, RemoteInfo, TransportError, UpgradedSocket};

pub struct WebSocketSink {
    inner: SplitSink<WebSocket, Message>,
}

pub struct WebSocketSource {
    inner: SplitStream<WebSocket>,
}

/// Splits an upgraded axum socket into broker-owned halves.
pub fn into_upgraded(socket: WebSocket, mut remote: RemoteInfo) -> UpgradedSocket {
    if remote.subprotocol.is_none() {
        remote.subprotocol =
            socket.protocol().and_then(|value| value.to_str().ok()).map(ToOwned::to_owned);
    }
    let (sink, source) = socket.split();
    UpgradedSocket::new(WebSocketSink { inner: sink }, WebSocketSource { inner: source }, remote)
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| TransportError::Send(error.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.inner
            .send(Message::Ping(vec![].into()))
            .await
            .map_err(|error| TransportError::Send(error.to_string()))
    }

    async fn close(&mut self) {
        let _ = self
            .inner
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "connection closed by broker".into(),
            })))
            .await;
        let _ = self.inner.close().await;
    }
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        let message = match self.inner.next().await? {
            Ok(message) => message,
            Err(error) => return Some(Err(TransportError::Receive(error.to_string()))),
        };

        Some(Ok(match message {
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Binary(payload) => Frame::Binary(payload.to_vec()),
            Message::Ping(_) | Message::Pong(_) => Frame::Control,
            Message::Close(_) => Frame::Close,
        }))
    }
}
