use huddle_protocol::{PartyId, ServerMessage};
use std::collections::HashMap;
use tokio::sync::{RwLock, mpsc};

/// Outbound queues of connected parties
///
/// Each party has exactly one unbounded queue drained by its socket writer
/// task, so messages addressed to one party are delivered in send order.
pub struct ConnectionManager {
    senders: RwLock<HashMap<PartyId, mpsc::UnboundedSender<String>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(&self, party_id: PartyId, sender: mpsc::UnboundedSender<String>) {
        self.senders.write().await.insert(party_id, sender);
        tracing::debug!("Party {} connected", party_id);
    }

    pub async fn remove_connection(&self, party_id: PartyId) -> bool {
        let removed = self.senders.write().await.remove(&party_id).is_some();
        if removed {
            tracing::debug!("Party {} disconnected", party_id);
        }
        removed
    }

    /// Send to every connected party, the originator included
    pub async fn broadcast(&self, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let senders = self.senders.read().await;
        tracing::debug!("Broadcasting to {} parties", senders.len());

        for (party_id, sender) in senders.iter() {
            if let Err(e) = sender.send(json.clone()) {
                tracing::error!("Failed to send message to {}: {}", party_id, e);
            }
        }
    }

    pub async fn send_to_party(&self, party_id: PartyId, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let senders = self.senders.read().await;

        if let Some(sender) = senders.get(&party_id) {
            if let Err(e) = sender.send(json) {
                tracing::error!("Failed to send message to {}: {}", party_id, e);
            }
        }
    }

    pub async fn is_connected(&self, party_id: PartyId) -> bool {
        self.senders.read().await.contains_key(&party_id)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
