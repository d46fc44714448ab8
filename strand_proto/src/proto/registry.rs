use crate::proto::connection::{Connection, ConnectionId};
use std::collections::HashMap;
use std::hash::Hash;
use strand_io::RwLock;

/// Concurrent map of live connections. TCP transports key it by
/// [`ConnectionId`]; UDP transports key it by peer address. Entries are
/// removed explicitly when their connection disconnects.
pub struct ConnectionRegistry<K> {
    connections: RwLock<HashMap<K, Connection>>,
}

impl<K: Eq + Hash + Clone> Default for ConnectionRegistry<K> {
    fn default() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> ConnectionRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the connection previously stored under `key`, if any
    pub fn insert(&self, key: K, connection: Connection) -> Option<Connection> {
        self.connections.write().insert(key, connection)
    }

    pub fn get(&self, key: &K) -> Option<Connection> {
        self.connections.read().get(key).cloned()
    }

    /// Returns the live connection under `key`, or stores the one produced by
    /// `create`. The second tuple element is true when `create` ran
    pub fn get_or_insert_with<E>(
        &self,
        key: K,
        create: impl FnOnce() -> Result<Connection, E>,
    ) -> Result<(Connection, bool), E> {
        if let Some(existing) = self.get(&key).filter(Connection::is_connected) {
            return Ok((existing, false));
        }

        let mut connections = self.connections.write();
        if let Some(existing) = connections.get(&key).filter(|c| c.is_connected()) {
            return Ok((existing.clone(), false));
        }

        let connection = create()?;
        let _ = connections.insert(key, connection.clone());
        Ok((connection, true))
    }

    pub fn remove(&self, key: &K) -> Option<Connection> {
        self.connections.write().remove(key)
    }

    /// Removes `key` only while it still maps to the connection `id`, so a
    /// replacement stored under the same key survives the old one's cleanup
    pub fn remove_if_current(&self, key: &K, id: ConnectionId) -> Option<Connection> {
        let mut connections = self.connections.write();
        if connections.get(key).map(Connection::id) == Some(id) {
            connections.remove(key)
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> Vec<Connection> {
        self.connections.read().values().cloned().collect()
    }

    pub fn drain(&self) -> Vec<Connection> {
        self.connections.write().drain().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}
