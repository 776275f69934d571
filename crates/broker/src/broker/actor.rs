//! The single task that owns the connection registry.
//!
//! Every mutation and every socket write goes through [`Request`]s on a
//! bounded channel, so registry operations are serialised without a lock.
//! Each request carries its own typed reply channel.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wsbroker_common::{
    protocol::{encode_event, SystemEvent},
    types::{ConnectionInfo, RegistrySnapshot, UserId},
};

use super::{
    callbacks::CallbackRegistry,
    connection::{advance_state, CloseReason, Connection, ConnectionHandle, ConnectionState},
    reader::{self, DisconnectHook, ReaderTask},
    registry::{ConnectionRegistry, SingleWrite},
    BrokerOptions, DeliveryReport,
};
use crate::{
    error::BrokerError,
    metrics,
    transport::{TransportError, UpgradedSocket},
};

pub(crate) type UpgradeFuture =
    Pin<Box<dyn Future<Output = Result<UpgradedSocket, TransportError>> + Send>>;
pub(crate) type UpgradeFn = Box<dyn FnOnce() -> UpgradeFuture + Send>;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, BrokerError>>;

pub(crate) enum Request {
    AddConnection { user_id: UserId, upgrade: UpgradeFn, reply: Reply<ConnectionHandle> },
    SendMessage { user_ids: Vec<UserId>, payload: String, reply: Reply<DeliveryReport> },
    SendToConnection { connection_id: Uuid, payload: String, reply: Reply<()> },
    Snapshot { reply: Reply<RegistrySnapshot> },
    UpdateMetadata { connection_id: Uuid, labels: BTreeMap<String, String>, reply: Reply<ConnectionInfo> },
    Disconnect { connection_id: Uuid, reason: CloseReason, reply: Reply<bool> },
    Heartbeat { reply: Reply<usize> },
}

impl Request {
    fn kind(&self) -> &'static str {
        match self {
            Self::AddConnection { .. } => "add_connection",
            Self::SendMessage { .. } => "send_message",
            Self::SendToConnection { .. } => "send_to_connection",
            Self::Snapshot { .. } => "snapshot",
            Self::UpdateMetadata { .. } => "update_metadata",
            Self::Disconnect { .. } => "disconnect",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Sends a request and waits for its reply.
///
/// A dropped reply sender means the loop panicked mid-request.
pub(crate) async fn call<T>(
    requests: &mpsc::Sender<Request>,
    build: impl FnOnce(Reply<T>) -> Request,
    timeout: Option<Duration>,
) -> Result<T, BrokerError> {
    let (reply, response) = oneshot::channel();
    requests.send(build(reply)).await.map_err(|_| BrokerError::Unavailable)?;

    let received = match timeout {
        Some(limit) => tokio::time::timeout(limit, response)
            .await
            .map_err(|_| BrokerError::Timeout(limit))?,
        None => response.await,
    };
    received.map_err(|_| BrokerError::Restarted)?
}

/// State that outlives a single run of the loop.
pub(crate) struct ActorContext {
    pub(crate) requests: Mutex<mpsc::Receiver<Request>>,
    pub(crate) sender: mpsc::WeakSender<Request>,
    pub(crate) callbacks: Arc<CallbackRegistry>,
    pub(crate) disconnect_hook: Option<Arc<dyn DisconnectHook>>,
    pub(crate) options: BrokerOptions,
}

/// One run of the actor loop. A restart after a panic begins with an empty registry.
pub(crate) async fn run(context: Arc<ActorContext>) {
    let mut requests = context.requests.lock().await;
    let mut actor = Actor { registry: ConnectionRegistry::default(), context: &context };
    metrics::set_active_connections(0);
    debug!("broker actor loop started");

    while let Some(request) = requests.recv().await {
        let kind = request.kind();
        actor.handle(request).await;
        debug!(request = kind, connections = actor.registry.len(), "broker request handled");
    }

    actor.shutdown().await;
    info!("broker actor loop stopped");
}

struct Actor<'a> {
    registry: ConnectionRegistry,
    context: &'a ActorContext,
}

impl Actor<'_> {
    fn write_timeout(&self) -> Duration {
        self.context.options.write_timeout
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::AddConnection { user_id, upgrade, reply } => {
                let result = self.add_connection(user_id, upgrade).await;
                let _ = reply.send(result);
            }
            Request::SendMessage { user_ids, payload, reply } => {
                let report = self.send_message(user_ids, &payload).await;
                let _ = reply.send(Ok(report));
            }
            Request::SendToConnection { connection_id, payload, reply } => {
                let result = self.send_to_connection(connection_id, &payload).await;
                let _ = reply.send(result);
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(Ok(self.registry.snapshot()));
            }
            Request::UpdateMetadata { connection_id, labels, reply } => {
                let result = self
                    .registry
                    .update_metadata(connection_id, labels)
                    .ok_or(BrokerError::ConnectionNotFound(connection_id));
                let _ = reply.send(result);
            }
            Request::Disconnect { connection_id, reason, reply } => {
                let removed = match self.registry.remove(connection_id) {
                    Some(connection) => {
                        self.retire(vec![connection], reason).await;
                        true
                    }
                    None => false,
                };
                let _ = reply.send(Ok(removed));
            }
            Request::Heartbeat { reply } => {
                let outcome = self.registry.ping_all(self.write_timeout()).await;
                let failed = outcome.failed.into_iter().map(|(connection, _)| connection).collect();
                self.retire(failed, CloseReason::HeartbeatFailed).await;
                let _ = reply.send(Ok(outcome.delivered));
            }
        }
    }

    async fn add_connection(
        &mut self,
        user_id: UserId,
        upgrade: UpgradeFn,
    ) -> Result<ConnectionHandle, BrokerError> {
        let UpgradedSocket { sink, source, remote } = match upgrade().await {
            Ok(socket) => socket,
            Err(error) => {
                warn!(user_id, error = %error, "connection upgrade failed");
                return Err(BrokerError::Upgrade(error));
            }
        };

        let mut connection_id = Uuid::new_v4();
        while self.registry.contains(connection_id) {
            connection_id = Uuid::new_v4();
        }

        let payload = encode_event(&SystemEvent::connected(connection_id))?;

        let info = ConnectionInfo {
            connection_id,
            user_id,
            remote_addr: remote.remote_addr,
            subprotocol: remote.subprotocol,
            network: remote.network,
            connected_at: Utc::now(),
            metadata: BTreeMap::new(),
        };
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        self.registry.insert(Connection::new(info.clone(), sink, Arc::clone(&state), shutdown_tx));
        advance_state(&state, ConnectionState::Open);
        metrics::increment_connections_opened();
        metrics::set_active_connections(self.registry.len());
        info!(
            user_id,
            connection_id = %connection_id,
            remote_addr = info.remote_addr.as_deref().unwrap_or(""),
            network = %info.network,
            "connection registered"
        );

        reader::spawn(ReaderTask {
            info: info.clone(),
            source,
            shutdown: shutdown_rx,
            state,
            requests: self.context.sender.clone(),
            callbacks: Arc::clone(&self.context.callbacks),
            disconnect_hook: self.context.disconnect_hook.clone(),
            max_frame_bytes: self.context.options.max_frame_bytes,
            respond_to_ping: self.context.options.respond_to_ping,
            request_timeout: self.context.options.request_timeout,
        });
        let handle = ConnectionHandle::new(info, state_rx);

        let outcome = self.registry.write_to_user(user_id, &payload, self.write_timeout()).await;

        let mut own_failure = None;
        let mut failed = Vec::with_capacity(outcome.failed.len());
        for (connection, error) in outcome.failed {
            if connection.id() == connection_id {
                own_failure = Some(error);
            }
            failed.push(connection);
        }
        self.retire(failed, CloseReason::WriteFailed).await;

        match own_failure {
            Some(source) => Err(BrokerError::Write { connection_id, source }),
            None => Ok(handle),
        }
    }

    async fn send_message(&mut self, user_ids: Vec<UserId>, payload: &str) -> DeliveryReport {
        let mut seen = HashSet::with_capacity(user_ids.len());
        let mut report = DeliveryReport::default();
        let mut failed = Vec::new();

        for user_id in user_ids {
            if !seen.insert(user_id) {
                continue;
            }
            let outcome = self.registry.write_to_user(user_id, payload, self.write_timeout()).await;
            report.delivered += outcome.delivered;
            for (connection, _) in outcome.failed {
                report.dropped.push(connection.id());
                failed.push(connection);
            }
        }

        self.retire(failed, CloseReason::WriteFailed).await;
        report
    }

    async fn send_to_connection(
        &mut self,
        connection_id: Uuid,
        payload: &str,
    ) -> Result<(), BrokerError> {
        match self.registry.write_to_connection(connection_id, payload, self.write_timeout()).await {
            SingleWrite::Delivered => Ok(()),
            SingleWrite::NotFound => Err(BrokerError::ConnectionNotFound(connection_id)),
            SingleWrite::Failed(connection, source) => {
                self.retire(vec![connection], CloseReason::WriteFailed).await;
                Err(BrokerError::Write { connection_id, source })
            }
        }
    }

    /// Closes detached connections and tells each owner's remaining sockets.
    ///
    /// Writes that fail during those notifications queue further removals,
    /// so every connection is announced exactly once.
    async fn retire(&mut self, connections: Vec<Connection>, reason: CloseReason) {
        if connections.is_empty() {
            return;
        }

        let limit = self.write_timeout();
        let mut pending: VecDeque<(Connection, CloseReason)> =
            connections.into_iter().map(|connection| (connection, reason)).collect();

        while let Some((connection, reason)) = pending.pop_front() {
            let connection_id = connection.id();
            let user_id = connection.user_id();
            connection.close(reason, limit).await;
            metrics::increment_connections_closed(reason.as_str());
            info!(user_id, connection_id = %connection_id, reason = reason.as_str(), "connection removed");

            let payload = match encode_event(&SystemEvent::disconnected(connection_id)) {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(error = %error, "failed to encode DISCONNECTED event");
                    continue;
                }
            };
            let outcome = self.registry.write_to_user(user_id, &payload, limit).await;
            pending.extend(
                outcome.failed.into_iter().map(|(connection, _)| (connection, CloseReason::WriteFailed)),
            );
        }

        metrics::set_active_connections(self.registry.len());
    }

    async fn shutdown(&mut self) {
        let connections = self.registry.drain();
        if connections.is_empty() {
            return;
        }

        info!(connections = connections.len(), "closing connections for broker shutdown");
        let limit = self.write_timeout();
        for connection in connections {
            connection.close(CloseReason::Shutdown, limit).await;
            metrics::increment_connections_closed(CloseReason::Shutdown.as_str());
        }
        metrics::set_active_connections(0);
    }
}
