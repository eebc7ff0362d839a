//! Endpoint registry: maps connection ids to usernames and delivery queues.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parley_common::{Endpoint, EndpointId, ServerMessage};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

/// A registered connection.
pub struct Registration {
    pub username: String,
    pub tx: mpsc::Sender<ServerMessage>,
    pub connected_at: Instant,
}

/// Thread-safe endpoint registry. Doubles as the user directory.
#[derive(Clone, Default)]
pub struct EndpointRegistry {
    endpoints: Arc<RwLock<HashMap<EndpointId, Registration>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Fails if the id is already taken.
    pub async fn register(
        &self,
        id: EndpointId,
        username: &str,
        tx: mpsc::Sender<ServerMessage>,
    ) -> Result<Endpoint, &'static str> {
        let mut map = self.endpoints.write().await;
        if map.contains_key(&id) {
            return Err("endpoint already registered");
        }
        map.insert(
            id.clone(),
            Registration {
                username: username.to_string(),
                tx,
                connected_at: Instant::now(),
            },
        );
        Ok(Endpoint::new(id, username))
    }

    /// Remove a connection. Returns how long it was registered, or `None`
    /// if it was not.
    pub async fn unregister(&self, id: &EndpointId) -> Option<Duration> {
        self.endpoints
            .write()
            .await
            .remove(id)
            .map(|reg| reg.connected_at.elapsed())
    }

    /// Directory lookup: id → `{id, username}`.
    pub async fn resolve(&self, id: &EndpointId) -> Option<Endpoint> {
        let map = self.endpoints.read().await;
        map.get(id)
            .map(|reg| Endpoint::new(id.clone(), reg.username.clone()))
    }

    /// Delivery queue for an endpoint.
    pub async fn sender(&self, id: &EndpointId) -> Option<mpsc::Sender<ServerMessage>> {
        self.endpoints.read().await.get(id).map(|reg| reg.tx.clone())
    }

    /// Delivery queues for every endpoint except `except`.
    pub async fn others(&self, except: &EndpointId) -> Vec<(EndpointId, mpsc::Sender<ServerMessage>)> {
        self.endpoints
            .read()
            .await
            .iter()
            .filter(|(id, _)| *id != except)
            .map(|(id, reg)| (id.clone(), reg.tx.clone()))
            .collect()
    }

    /// Number of connected endpoints.
    pub async fn count(&self) -> usize {
        self.endpoints.read().await.len()
    }
}
