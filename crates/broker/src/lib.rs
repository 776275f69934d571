// wsbroker: per-user websocket connection broker.
//
// A single actor loop owns the user -> connections registry; reader tasks
// dispatch inbound events to registered handlers; a supervisor restarts
// either loop after a panic.

pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod transport;

pub use broker::{
    Broker, BrokerBuilder, BrokerOptions, CallbackRegistry, CloseReason, ConnectionHandle,
    ConnectionState, DeliveryReport, DisconnectHook, DispatchOutcome, EventHandler, IncomingEvent,
};
pub use error::BrokerError;
pub use wsbroker_common::{
    protocol::{SocketEvent, SystemEvent},
    types::{ConnectionInfo, RegistrySnapshot, UserId},
};
