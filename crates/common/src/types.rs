// Connection bookkeeping types shared between the broker and its observers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an authenticated user owning one or more connections.
pub type UserId = i64;

/// Read-only description of one live connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub user_id: UserId,
    pub remote_addr: Option<String>,
    pub subprotocol: Option<String>,
    /// Transport network name, e.g. `tcp` or `memory`.
    pub network: String,
    pub connected_at: DateTime<Utc>,
    /// Free-form labels attached after registration.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Point-in-time copy of the connection registry, keyed by user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct RegistrySnapshot {
    pub users: BTreeMap<UserId, Vec<ConnectionInfo>>,
}

impl RegistrySnapshot {
    pub fn connections_for(&self, user_id: UserId) -> &[ConnectionInfo] {
        self.users.get(&user_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains(&self, connection_id: Uuid) -> bool {
        self.iter().any(|info| info.connection_id == connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.users.values().map(Vec::len).sum()
    }

    pub fn user_count(&self) -> usize {
        self.users.values().filter(|connections| !connections.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.connection_count() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionInfo> {
        self.users.values().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(user_id: UserId) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: Uuid::new_v4(),
            user_id,
            remote_addr: Some("127.0.0.1:50000".to_string()),
            subprotocol: None,
            network: "tcp".to_string(),
            connected_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn counts_connections_across_users() {
        let first = info(7);
        let second = info(7);
        let third = info(9);
        let mut snapshot = RegistrySnapshot::default();
        snapshot.users.insert(7, vec![first.clone(), second]);
        snapshot.users.insert(9, vec![third]);
        snapshot.users.insert(11, Vec::new());

        assert_eq!(snapshot.connection_count(), 3);
        assert_eq!(snapshot.user_count(), 2);
        assert_eq!(snapshot.connections_for(7).len(), 2);
        assert!(snapshot.connections_for(42).is_empty());
        assert!(snapshot.contains(first.connection_id));
        assert!(!snapshot.contains(Uuid::new_v4()));
    }

    #[test]
    fn serializes_as_plain_user_map() {
        let mut snapshot = RegistrySnapshot::default();
        snapshot.users.insert(7, vec![info(7)]);

        let value = serde_json::to_value(&snapshot).expect("snapshot should serialize");
        assert!(value.get("7").is_some());
        assert_eq!(value["7"][0]["user_id"], 7);
        assert_eq!(value["7"][0]["network"], "tcp");
    }
}
