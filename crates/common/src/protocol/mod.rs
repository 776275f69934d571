pub mod event;

pub use event::{decode_event, decode_event_bytes, encode_event, SocketEvent, SystemEvent};
