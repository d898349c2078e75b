//! Resource Registry
//!
//! Per-party ownership of relay handles: one transport, one published stream
//! and one subscribed stream, each kept in its own key-scoped map.

use crate::relay::{RelayConsumer, RelayProducer, RelayTransport};
use huddle_protocol::PartyId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Connection state of a registered transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Connected,
}

#[derive(Clone)]
pub struct TransportEntry {
    pub transport: Arc<dyn RelayTransport>,
    pub state: TransportState,
}

impl TransportEntry {
    pub fn new(transport: Arc<dyn RelayTransport>) -> Self {
        Self {
            transport,
            state: TransportState::Created,
        }
    }

    pub fn id(&self) -> &str {
        self.transport.id()
    }
}

/// One resource kind, keyed by party
pub struct ResourceMap<T> {
    entries: RwLock<HashMap<PartyId, T>>,
}

impl<T: Clone> ResourceMap<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Store a handle, returning the one it replaced
    pub async fn put(&self, party_id: PartyId, handle: T) -> Option<T> {
        self.entries.write().await.insert(party_id, handle)
    }

    /// Store a handle only if the party has none; hands it back otherwise
    pub async fn insert_if_absent(&self, party_id: PartyId, handle: T) -> Result<(), T> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&party_id) {
            return Err(handle);
        }
        entries.insert(party_id, handle);
        Ok(())
    }

    pub async fn get(&self, party_id: PartyId) -> Option<T> {
        self.entries.read().await.get(&party_id).cloned()
    }

    pub async fn remove(&self, party_id: PartyId) -> Option<T> {
        self.entries.write().await.remove(&party_id)
    }

    /// Apply `f` to the party's entry; returns whether an entry was updated
    pub async fn update<F>(&self, party_id: PartyId, f: F) -> bool
    where
        F: FnOnce(&mut T) -> bool,
    {
        match self.entries.write().await.get_mut(&party_id) {
            Some(entry) => f(entry),
            None => false,
        }
    }

    pub async fn list_all(&self) -> Vec<(PartyId, T)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(party_id, handle)| (*party_id, handle.clone()))
            .collect()
    }

    pub async fn contains(&self, party_id: PartyId) -> bool {
        self.entries.read().await.contains_key(&party_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl<T: Clone> Default for ResourceMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// All relay handles held on behalf of connected parties
#[derive(Default)]
pub struct ResourceRegistry {
    pub transports: ResourceMap<TransportEntry>,
    pub producers: ResourceMap<Arc<dyn RelayProducer>>,
    pub consumers: ResourceMap<Arc<dyn RelayConsumer>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries of any kind held for a party
    pub async fn entry_count(&self, party_id: PartyId) -> usize {
        [
            self.producers.contains(party_id).await,
            self.consumers.contains(party_id).await,
            self.transports.contains(party_id).await,
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }

    /// Parties holding at least one entry
    pub async fn parties(&self) -> Vec<PartyId> {
        let mut parties: Vec<PartyId> = self
            .transports
            .list_all()
            .await
            .into_iter()
            .map(|(party_id, _)| party_id)
            .chain(self.producers.list_all().await.into_iter().map(|(p, _)| p))
            .chain(self.consumers.list_all().await.into_iter().map(|(p, _)| p))
            .collect();
        parties.sort();
        parties.dedup();
        parties
    }
}
