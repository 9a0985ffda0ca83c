// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry of live client connections.
//!
//! Owned by the hosting layer: created at startup, passed to whatever needs
//! it, and [`cleared`](ConnectionRegistry::clear) at shutdown. There is no
//! global instance.

use std::collections::HashSet;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub user_id: String,
    /// Epoch millis
    pub connected_at: i64,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, ConnectionInfo>,
    by_user: DashMap<String, HashSet<Uuid>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection for `user_id` and return its id.
    pub fn register(&self, user_id: impl Into<String>) -> Uuid {
        let connection_id = Uuid::new_v4();
        self.register_with_id(connection_id, user_id);
        connection_id
    }

    /// Register a connection whose id was assigned by the transport.
    /// Re-registering an id moves it to the new user.
    pub fn register_with_id(&self, connection_id: Uuid, user_id: impl Into<String>) {
        let user_id = user_id.into();
        let info = ConnectionInfo {
            connection_id,
            user_id: user_id.clone(),
            connected_at: crate::record::now_millis(),
        };

        if let Some(previous) = self.connections.insert(connection_id, info) {
            self.detach(&previous);
        }
        self.by_user.entry(user_id.clone()).or_default().insert(connection_id);

        debug!(%connection_id, user_id = %user_id, "Connection registered");
        crate::metrics::set_connections(self.connections.len());
    }

    /// Forget a connection. Unknown ids are ignored.
    pub fn unregister(&self, connection_id: Uuid) -> Option<ConnectionInfo> {
        let (_, info) = self.connections.remove(&connection_id)?;
        self.detach(&info);
        debug!(%connection_id, user_id = %info.user_id, "Connection unregistered");
        crate::metrics::set_connections(self.connections.len());
        Some(info)
    }

    fn detach(&self, info: &ConnectionInfo) {
        if let Some(mut ids) = self.by_user.get_mut(&info.user_id) {
            ids.remove(&info.connection_id);
        }
        self.by_user.remove_if(&info.user_id, |_, ids| ids.is_empty());
    }

    #[must_use]
    pub fn get(&self, connection_id: Uuid) -> Option<ConnectionInfo> {
        self.connections.get(&connection_id).map(|c| c.value().clone())
    }

    /// Live connections of `user_id`, oldest first.
    #[must_use]
    pub fn connections_for(&self, user_id: &str) -> Vec<ConnectionInfo> {
        let ids: Vec<Uuid> = match self.by_user.get(user_id) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Vec::new(),
        };
        let mut found: Vec<ConnectionInfo> = ids.iter().filter_map(|id| self.get(*id)).collect();
        found.sort_by_key(|c| c.connected_at);
        found
    }

    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.by_user.contains_key(user_id)
    }

    #[must_use]
    pub fn online_users(&self) -> usize {
        self.by_user.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drop every connection (shutdown).
    pub fn clear(&self) {
        self.connections.clear();
        self.by_user.clear();
        crate::metrics::set_connections(0);
    }
}
