use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use tracing::warn;
use uuid::Uuid;
use wsbroker_common::types::{ConnectionInfo, RegistrySnapshot, UserId};

use super::connection::Connection;
use crate::{metrics, transport::TransportError};

/// Connections whose write failed, already detached from the registry.
pub(crate) type Failed = Vec<(Connection, TransportError)>;

#[derive(Default)]
pub(crate) struct WriteOutcome {
    pub(crate) delivered: usize,
    pub(crate) failed: Failed,
}

pub(crate) enum SingleWrite {
    Delivered,
    NotFound,
    Failed(Connection, TransportError),
}

/// User-keyed connection table. Only the actor loop touches it.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    users: HashMap<UserId, Vec<Connection>>,
    owners: HashMap<Uuid, UserId>,
}

impl ConnectionRegistry {
    pub(crate) fn contains(&self, connection_id: Uuid) -> bool {
        self.owners.contains_key(&connection_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.owners.len()
    }

    pub(crate) fn insert(&mut self, connection: Connection) {
        self.owners.insert(connection.id(), connection.user_id());
        self.users.entry(connection.user_id()).or_default().push(connection);
    }

    /// Detaches one connection. Users left with no connections are dropped.
    pub(crate) fn remove(&mut self, connection_id: Uuid) -> Option<Connection> {
        let user_id = self.owners.remove(&connection_id)?;
        let connections = self.users.remove(&user_id)?;

        let mut removed = None;
        let kept: Vec<Connection> = connections
            .into_iter()
            .filter_map(|connection| {
                if connection.id() == connection_id {
                    removed = Some(connection);
                    None
                } else {
                    Some(connection)
                }
            })
            .collect();

        if !kept.is_empty() {
            self.users.insert(user_id, kept);
        }
        removed
    }

    /// Writes `text` to every connection of `user_id`; failures are detached.
    pub(crate) async fn write_to_user(
        &mut self,
        user_id: UserId,
        text: &str,
        limit: Duration,
    ) -> WriteOutcome {
        let Some(connections) = self.users.remove(&user_id) else {
            return WriteOutcome::default();
        };

        let mut outcome = WriteOutcome::default();
        let mut kept = Vec::with_capacity(connections.len());
        for mut connection in connections {
            match connection.write(text, limit).await {
                Ok(()) => {
                    outcome.delivered += 1;
                    kept.push(connection);
                }
                Err(error) => {
                    warn!(
                        user_id,
                        connection_id = %connection.id(),
                        error = %error,
                        "socket write failed; removing connection"
                    );
                    metrics::increment_write_failures();
                    self.owners.remove(&connection.id());
                    outcome.failed.push((connection, error));
                }
            }
        }

        if !kept.is_empty() {
            self.users.insert(user_id, kept);
        }
        outcome
    }

    pub(crate) async fn write_to_connection(
        &mut self,
        connection_id: Uuid,
        text: &str,
        limit: Duration,
    ) -> SingleWrite {
        let Some(connection) = self.find_mut(connection_id) else {
            return SingleWrite::NotFound;
        };

        match connection.write(text, limit).await {
            Ok(()) => SingleWrite::Delivered,
            Err(error) => {
                warn!(connection_id = %connection_id, error = %error, "socket write failed; removing connection");
                metrics::increment_write_failures();
                match self.remove(connection_id) {
                    Some(connection) => SingleWrite::Failed(connection, error),
                    None => SingleWrite::NotFound,
                }
            }
        }
    }

    /// Sends a transport ping to every connection; failures are detached.
    pub(crate) async fn ping_all(&mut self, limit: Duration) -> WriteOutcome {
        let mut outcome = WriteOutcome::default();
        let users: Vec<UserId> = self.users.keys().copied().collect();

        for user_id in users {
            let Some(connections) = self.users.remove(&user_id) else {
                continue;
            };
            let mut kept = Vec::with_capacity(connections.len());
            for mut connection in connections {
                match connection.ping(limit).await {
                    Ok(()) => {
                        outcome.delivered += 1;
                        kept.push(connection);
                    }
                    Err(error) => {
                        metrics::increment_write_failures();
                        warn!(
                            user_id,
                            connection_id = %connection.id(),
                            error = %error,
                            "heartbeat ping failed; removing connection"
                        );
                        self.owners.remove(&connection.id());
                        outcome.failed.push((connection, error));
                    }
                }
            }
            if !kept.is_empty() {
                self.users.insert(user_id, kept);
            }
        }
        outcome
    }

    /// Merges `labels` into the connection's metadata.
    pub(crate) fn update_metadata(
        &mut self,
        connection_id: Uuid,
        labels: BTreeMap<String, String>,
    ) -> Option<ConnectionInfo> {
        let connection = self.find_mut(connection_id)?;
        connection.info_mut().metadata.extend(labels);
        Some(connection.info().clone())
    }

    pub(crate) fn snapshot(&self) -> RegistrySnapshot {
        let users = self
            .users
            .iter()
            .map(|(user_id, connections)| {
                (*user_id, connections.iter().map(|connection| connection.info().clone()).collect())
            })
            .collect();
        RegistrySnapshot { users }
    }

    pub(crate) fn drain(&mut self) -> Vec<Connection> {
        self.owners.clear();
        self.users.drain().flat_map(|(_, connections)| connections).collect()
    }

    fn find_mut(&mut self, connection_id: Uuid) -> Option<&mut Connection> {
        let user_id = self.owners.get(&connection_id)?;
        self.users
            .get_mut(user_id)?
            .iter_mut()
            .find(|connection| connection.id() == connection_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use tokio::sync::{oneshot, watch};

    use super::*;
    use crate::{
        broker::connection::ConnectionState,
        transport::memory::{socket_pair, MemoryPeer},
    };

    const LIMIT: Duration = Duration::from_secs(1);

    fn connection(user_id: UserId) -> (Connection, MemoryPeer) {
        let (socket, peer) = socket_pair();
        let info = ConnectionInfo {
            connection_id: Uuid::new_v4(),
            user_id,
            remote_addr: None,
            subprotocol: None,
            network: "memory".to_string(),
            connected_at: Utc::now(),
            metadata: BTreeMap::new(),
        };
        let (state, _) = watch::channel(ConnectionState::Open);
        let (shutdown, _) = oneshot::channel();
        (Connection::new(info, socket.sink, Arc::new(state), shutdown), peer)
    }

    #[tokio::test]
    async fn write_to_user_detaches_only_failing_connection() {
        let mut registry = ConnectionRegistry::default();
        let (first, mut first_peer) = connection(1);
        let (second, second_peer) = connection(1);
        let second_id = second.id();
        registry.insert(first);
        registry.insert(second);
        second_peer.fail_writes();

        let outcome = registry.write_to_user(1, "hello", LIMIT).await;

        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0.id(), second_id);
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(second_id));
        assert_eq!(first_peer.recv_text().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn writing_to_absent_user_is_a_no_op() {
        let mut registry = ConnectionRegistry::default();
        let outcome = registry.write_to_user(42, "hello", LIMIT).await;

        assert_eq!(outcome.delivered, 0);
        assert!(outcome.failed.is_empty());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn removing_last_connection_drops_user_entry() {
        let mut registry = ConnectionRegistry::default();
        let (only, _peer) = connection(5);
        let id = only.id();
        registry.insert(only);

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.snapshot().connections_for(5).is_empty());
    }

    #[test]
    fn metadata_updates_merge_labels() {
        let mut registry = ConnectionRegistry::default();
        let (only, _peer) = connection(5);
        let id = only.id();
        registry.insert(only);

        registry.update_metadata(id, BTreeMap::from([("region".to_string(), "eu".to_string())]));
        let info = registry
            .update_metadata(id, BTreeMap::from([("tier".to_string(), "gold".to_string())]))
            .expect("connection should exist");

        assert_eq!(info.metadata.len(), 2);
        assert_eq!(registry.snapshot().connections_for(5)[0].metadata["region"], "eu");
        assert!(registry.update_metadata(Uuid::new_v4(), BTreeMap::new()).is_none());
    }

    #[tokio::test]
    async fn ping_all_detaches_dead_connections() {
        let mut registry = ConnectionRegistry::default();
        let (alive, alive_peer) = connection(1);
        let (dead, dead_peer) = connection(2);
        registry.insert(alive);
        registry.insert(dead);
        dead_peer.fail_writes();

        let outcome = registry.ping_all(LIMIT).await;

        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(alive_peer.ping_count(), 1);
        assert_eq!(registry.snapshot().user_count(), 1);
    }

    #[tokio::test]
    async fn failed_heartbeat_ping_counts_as_write_failure() {
        metrics::set_global_metrics(Arc::new(metrics::BrokerMetrics::default()));
        let counter = metrics::global_metrics().expect("global metrics should be installed");

        let mut registry = ConnectionRegistry::default();
        let (dead, dead_peer) = connection(3);
        registry.insert(dead);
        dead_peer.fail_writes();

        let before = counter.write_failures();
        let outcome = registry.ping_all(LIMIT).await;

        assert_eq!(outcome.failed.len(), 1);
        assert!(counter.write_failures() > before);
    }
}
