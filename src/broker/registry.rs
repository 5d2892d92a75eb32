//! Live line-transport connections.
//!
//! The registry is never used on its own: it sits next to the
//! `SubscriptionIndex` inside the broker state and both are mutated under the
//! same lock, so a connection and its subscriptions disappear together.

use std::collections::HashMap;

use crate::client::{Client, ConnectionId};
use crate::utils::RegisterError;

#[derive(Debug)]
pub struct ConnectionRegistry {
    clients: HashMap<ConnectionId, Client>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Empty registry admitting at most `max_connections` clients.
    pub fn new(max_connections: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_connections,
        }
    }

    /// Admits `client` unless the cap is reached. Gives the client back on
    /// refusal so the caller can close it.
    pub fn register(&mut self, client: Client) -> Result<ConnectionId, (Client, RegisterError)> {
        if self.clients.len() >= self.max_connections {
            return Err((client, RegisterError::Limit(self.max_connections)));
        }
        let id = client.id;
        self.clients.insert(id, client);
        Ok(id)
    }

    /// Removes and returns the client, if it was registered.
    pub fn unregister(&mut self, id: &ConnectionId) -> Option<Client> {
        self.clients.remove(id)
    }

    /// The live client for `id`.
    pub fn get(&self, id: &ConnectionId) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Whether `id` is still registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.clients.contains_key(id)
    }

    /// Number of live clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Live clients, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    /// Removes every client and hands them back for closing.
    pub fn drain(&mut self) -> Vec<Client> {
        self.clients.drain().map(|(_, c)| c).collect()
    }
}
