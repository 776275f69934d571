use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{debug, error, warn};
use uuid::Uuid;
use wsbroker_common::{protocol::SocketEvent, types::UserId};

use super::supervisor::panic_message;
use crate::metrics;

/// An inbound event together with the connection it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingEvent {
    pub user_id: UserId,
    pub event: SocketEvent,
    pub connection_id: Uuid,
}

/// Handler for one event name.
///
/// Any `Fn(IncomingEvent) -> impl Future<Output = ()>` closure implements this.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: IncomingEvent);
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(IncomingEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, event: IncomingEvent) {
        (self)(event).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    Unregistered,
    Panicked,
}

impl DispatchOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Handled => "handled",
            Self::Unregistered => "unregistered",
            Self::Panicked => "panicked",
        }
    }
}

/// Event-name to handler table shared by every reader task.
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`CallbackRegistry::register`].
    pub fn with_handler(self, event_name: impl Into<String>, handler: impl EventHandler) -> Self {
        self.register(event_name, handler);
        self
    }

    /// Installs `handler` for `event_name`, replacing any previous one.
    /// Returns `true` when a handler was replaced.
    pub fn register(&self, event_name: impl Into<String>, handler: impl EventHandler) -> bool {
        let event_name = event_name.into();
        let replaced = self
            .handlers
            .write()
            .expect("callback registry lock poisoned")
            .insert(event_name.clone(), Arc::new(handler))
            .is_some();
        debug!(event_name = %event_name, replaced, "event handler registered");
        replaced
    }

    pub fn unregister(&self, event_name: &str) -> bool {
        self.handlers.write().expect("callback registry lock poisoned").remove(event_name).is_some()
    }

    pub fn contains(&self, event_name: &str) -> bool {
        self.handlers.read().expect("callback registry lock poisoned").contains_key(event_name)
    }

    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.handlers.read().expect("callback registry lock poisoned").keys().cloned().collect();
        names.sort();
        names
    }

    fn handler(&self, event_name: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.read().expect("callback registry lock poisoned").get(event_name).cloned()
    }

    /// Runs the handler registered for the event's name.
    ///
    /// A panicking handler is contained here; the caller keeps reading.
    pub async fn dispatch(&self, incoming: IncomingEvent) -> DispatchOutcome {
        let Some(handler) = self.handler(&incoming.event.event_name) else {
            if incoming.event.system_event().is_some() {
                debug!(
                    event_name = %incoming.event.event_name,
                    connection_id = %incoming.connection_id,
                    "no handler for system event"
                );
            } else {
                warn!(
                    event_name = %incoming.event.event_name,
                    user_id = incoming.user_id,
                    connection_id = %incoming.connection_id,
                    "dropping event without registered handler"
                );
            }
            metrics::record_dispatch(DispatchOutcome::Unregistered.as_str());
            return DispatchOutcome::Unregistered;
        };

        let event_name = incoming.event.event_name.clone();
        let connection_id = incoming.connection_id;
        let outcome = match AssertUnwindSafe(handler.handle(incoming)).catch_unwind().await {
            Ok(()) => DispatchOutcome::Handled,
            Err(payload) => {
                error!(
                    event_name = %event_name,
                    connection_id = %connection_id,
                    panic = %panic_message(payload.as_ref()),
                    "event handler panicked"
                );
                DispatchOutcome::Panicked
            }
        };
        metrics::record_dispatch(outcome.as_str());
        outcome
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry").field("event_names", &self.event_names()).finish()
    }
}
