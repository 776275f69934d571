// Socket event envelope exchanged over every broker connection.
//
// One JSON object per transport frame:
//   {"event_key": 4, "event_name": "ORDER_SHIPPED", "data": {...}}

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Wire envelope for a single event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SocketEvent {
    #[serde(alias = "EventKey")]
    pub event_key: i64,
    #[serde(alias = "EventName")]
    pub event_name: String,
    /// Opaque payload; absent in the frame decodes as `null`.
    #[serde(default, alias = "Data")]
    pub data: Value,
}

impl SocketEvent {
    pub fn new(event_key: i64, event_name: impl Into<String>, data: Value) -> Self {
        Self { event_key, event_name: event_name.into(), data }
    }

    /// Returns the built-in event this envelope names, if any.
    pub fn system_event(&self) -> Option<SystemEvent> {
        SystemEvent::from_name(&self.event_name)
    }
}

/// Events the broker itself emits or answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemEvent {
    Ping,
    Pong,
    Connected,
    Disconnected,
}

impl SystemEvent {
    pub const ALL: [SystemEvent; 4] =
        [SystemEvent::Ping, SystemEvent::Pong, SystemEvent::Connected, SystemEvent::Disconnected];

    pub const fn key(self) -> i64 {
        match self {
            Self::Ping => 0,
            Self::Pong => 1,
            Self::Connected => 2,
            Self::Disconnected => 3,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.name() == name)
    }

    pub fn event(self, data: Value) -> SocketEvent {
        SocketEvent::new(self.key(), self.name(), data)
    }

    /// CONNECTED envelope announcing `connection_id` to the user's other sockets.
    pub fn connected(connection_id: Uuid) -> SocketEvent {
        Self::Connected.event(json!({
            "connection_id": connection_id,
            "message": "Client Connected",
        }))
    }

    /// DISCONNECTED envelope announcing that `connection_id` closed.
    pub fn disconnected(connection_id: Uuid) -> SocketEvent {
        Self::Disconnected.event(json!({
            "connection_id": connection_id,
            "message": "Client Disconnected",
        }))
    }
}

pub fn decode_event(raw: &str) -> Result<SocketEvent, serde_json::Error> {
    serde_json::from_str::<SocketEvent>(raw)
}

pub fn decode_event_bytes(raw: &[u8]) -> Result<SocketEvent, serde_json::Error> {
    serde_json::from_slice::<SocketEvent>(raw)
}

pub fn encode_event(event: &SocketEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}
