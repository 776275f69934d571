//! Connection broker: the registry-owning actor loop and its public handle.
//!
//! [`Broker`] is a cheap, cloneable handle. Every operation becomes a
//! request to the actor loop and awaits a typed reply. Each registered
//! connection gets its own reader task that dispatches inbound events to
//! the [`CallbackRegistry`] and reports closure back to the loop.

mod actor;
pub mod callbacks;
pub mod connection;
mod heartbeat;
mod reader;
mod registry;
pub mod supervisor;

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::{mpsc, Mutex},
    task::AbortHandle,
};
use tracing::info;
use uuid::Uuid;
use wsbroker_common::{
    protocol::{encode_event, SocketEvent},
    types::{ConnectionInfo, RegistrySnapshot, UserId},
};

use self::{
    actor::{ActorContext, Request, UpgradeFn, UpgradeFuture},
    supervisor::{PanicReporter, Supervisor, TracingPanicReporter},
};
pub use self::{
    callbacks::{CallbackRegistry, DispatchOutcome, EventHandler, IncomingEvent},
    connection::{CloseReason, ConnectionHandle, ConnectionState},
    reader::DisconnectHook,
    supervisor::PanicReport,
};
use crate::{
    error::BrokerError,
    transport::{TransportError, UpgradedSocket},
};

pub const ACTOR_LOOP: &str = "broker-actor";
pub const HEARTBEAT_LOOP: &str = "heartbeat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    /// Capacity of the request channel. Senders wait when it is full.
    pub request_capacity: usize,
    /// How long a caller waits for the loop to reply. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Per-socket write deadline; expiry counts as a failed write.
    pub write_timeout: Duration,
    /// Transport ping cadence. `None` disables the heartbeat loop.
    pub heartbeat_interval: Option<Duration>,
    /// Inbound frames larger than this are dropped without parsing.
    pub max_frame_bytes: usize,
    /// Pause before a panicked loop is restarted.
    pub restart_delay: Duration,
    /// Answer inbound PING events with PONG on the same connection.
    pub respond_to_ping: bool,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            request_capacity: 1024,
            request_timeout: Some(Duration::from_secs(10)),
            write_timeout: Duration::from_secs(5),
            heartbeat_interval: Some(Duration::from_secs(15)),
            max_frame_bytes: 256 * 1024,
            restart_delay: Duration::from_millis(100),
            respond_to_ping: true,
        }
    }
}

/// Result of a multi-user send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Sockets the payload was written to.
    pub delivered: usize,
    /// Connections removed because their write failed.
    pub dropped: Vec<Uuid>,
}

pub struct BrokerBuilder {
    options: BrokerOptions,
    callbacks: Arc<CallbackRegistry>,
    disconnect_hook: Option<Arc<dyn DisconnectHook>>,
    panic_reporter: Arc<dyn PanicReporter>,
}

impl BrokerBuilder {
    pub fn options(mut self, options: BrokerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn callbacks(mut self, callbacks: Arc<CallbackRegistry>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn disconnect_hook(mut self, hook: impl DisconnectHook) -> Self {
        self.disconnect_hook = Some(Arc::new(hook));
        self
    }

    pub fn panic_reporter(mut self, reporter: impl PanicReporter) -> Self {
        self.panic_reporter = Arc::new(reporter);
        self
    }

    /// Spawns the supervised actor loop (and heartbeat, if enabled).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> Broker {
        let Self { options, callbacks, disconnect_hook, panic_reporter } = self;
        let (sender, receiver) = mpsc::channel(options.request_capacity.max(1));

        let context = Arc::new(ActorContext {
            requests: Mutex::new(receiver),
            sender: sender.downgrade(),
            callbacks: Arc::clone(&callbacks),
            disconnect_hook,
            options: options.clone(),
        });

        // The actor loop stops by itself once every `Broker` clone is dropped.
        Supervisor::new(ACTOR_LOOP, Arc::clone(&panic_reporter), options.restart_delay)
            .spawn(move || actor::run(Arc::clone(&context)));

        let heartbeat = options.heartbeat_interval.filter(|interval| !interval.is_zero()).map(|interval| {
            let weak = sender.downgrade();
            let timeout = options.request_timeout;
            Supervisor::new(HEARTBEAT_LOOP, Arc::clone(&panic_reporter), options.restart_delay)
                .spawn(move || heartbeat::run(weak.clone(), interval, timeout))
                .abort_handle()
        });

        info!(
            request_capacity = options.request_capacity,
            heartbeat_ms = options.heartbeat_interval.map(|interval| interval.as_millis() as u64),
            "broker started"
        );

        Broker { inner: Arc::new(BrokerInner { requests: sender, callbacks, options, heartbeat }) }
    }
}

struct BrokerInner {
    requests: mpsc::Sender<Request>,
    callbacks: Arc<CallbackRegistry>,
    options: BrokerOptions,
    heartbeat: Option<AbortHandle>,
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
    }
}

/// Cloneable handle to a running broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder {
            options: BrokerOptions::default(),
            callbacks: Arc::new(CallbackRegistry::new()),
            disconnect_hook: None,
            panic_reporter: Arc::new(TracingPanicReporter),
        }
    }

    /// Starts a broker with the given options and an empty callback table.
    pub fn start(options: BrokerOptions) -> Self {
        Self::builder().options(options).start()
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.inner.options
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.inner.callbacks
    }

    /// Installs a handler for inbound events named `event_name`.
    pub fn register_callback(&self, event_name: impl Into<String>, handler: impl EventHandler) -> bool {
        self.inner.callbacks.register(event_name, handler)
    }

    /// Registers a new connection for `user_id`.
    ///
    /// `upgrade` runs inside the actor loop. If it fails nothing is
    /// registered. On success the user's sockets, including the new one,
    /// receive a CONNECTED event.
    pub async fn register<F, Fut>(&self, user_id: UserId, upgrade: F) -> Result<ConnectionHandle, BrokerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<UpgradedSocket, TransportError>> + Send + 'static,
    {
        let upgrade: UpgradeFn = Box::new(move || Box::pin(upgrade()) as UpgradeFuture);
        self.call(|reply| Request::AddConnection { user_id, upgrade, reply }).await
    }

    /// Registers a socket that has already been upgraded.
    pub async fn register_socket(
        &self,
        user_id: UserId,
        socket: UpgradedSocket,
    ) -> Result<ConnectionHandle, BrokerError> {
        self.register(user_id, move || async move { Ok(socket) }).await
    }

    /// Writes `event` to every connection of every listed user.
    ///
    /// Duplicate user ids are sent to once; unknown ones are skipped.
    pub async fn broadcast(
        &self,
        user_ids: &[UserId],
        event: &SocketEvent,
    ) -> Result<DeliveryReport, BrokerError> {
        let payload = encode_event(event)?;
        let user_ids = user_ids.to_vec();
        self.call(|reply| Request::SendMessage { user_ids, payload, reply }).await
    }

    pub async fn send_to_connection(
        &self,
        connection_id: Uuid,
        event: &SocketEvent,
    ) -> Result<(), BrokerError> {
        let payload = encode_event(event)?;
        self.call(|reply| Request::SendToConnection { connection_id, payload, reply }).await
    }

    /// Copy of the registry as seen by the actor loop right now.
    pub async fn snapshot(&self) -> Result<RegistrySnapshot, BrokerError> {
        self.call(|reply| Request::Snapshot { reply }).await
    }

    /// Merges `labels` into a connection's metadata and returns the result.
    pub async fn update_metadata(
        &self,
        connection_id: Uuid,
        labels: BTreeMap<String, String>,
    ) -> Result<ConnectionInfo, BrokerError> {
        self.call(|reply| Request::UpdateMetadata { connection_id, labels, reply }).await
    }

    /// Closes and removes a connection. Returns `false` if it was not registered.
    pub async fn disconnect(&self, connection_id: Uuid) -> Result<bool, BrokerError> {
        self.call(|reply| Request::Disconnect { connection_id, reason: CloseReason::Requested, reply })
            .await
    }

    /// Pings every socket now and returns how many are still alive.
    pub async fn heartbeat(&self) -> Result<usize, BrokerError> {
        self.call(|reply| Request::Heartbeat { reply }).await
    }

    async fn call<T>(&self, build: impl FnOnce(actor::Reply<T>) -> Request) -> Result<T, BrokerError> {
        actor::call(&self.inner.requests, build, self.inner.options.request_timeout).await
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("options", &self.inner.options)
            .field("callbacks", &self.inner.callbacks)
            .finish()
    }
}
