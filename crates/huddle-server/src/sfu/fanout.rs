use crate::registry::ResourceRegistry;
use crate::ws::connections::ConnectionManager;
use huddle_protocol::{PartyId, ProducerInfo, ServerMessage};
use std::sync::Arc;

/// Announces changes to the set of published streams
pub struct FanOut {
    connections: Arc<ConnectionManager>,
    registry: Arc<ResourceRegistry>,
    /// Re-announce every publication when a party asks for the list
    rebroadcast_on_discovery: bool,
}

impl FanOut {
    pub fn new(
        connections: Arc<ConnectionManager>,
        registry: Arc<ResourceRegistry>,
        rebroadcast_on_discovery: bool,
    ) -> Self {
        Self {
            connections,
            registry,
            rebroadcast_on_discovery,
        }
    }

    pub async fn broadcast_stream_available(&self, stream_id: &str, party_id: PartyId) {
        tracing::debug!("Announcing stream {} of party {}", stream_id, party_id);
        self.connections
            .broadcast(&ServerMessage::NewStream {
                stream_id: stream_id.to_string(),
                user_id: party_id,
            })
            .await;
    }

    pub async fn broadcast_stream_removed(&self, party_id: PartyId) {
        tracing::debug!("Announcing removal of party {}'s stream", party_id);
        self.connections
            .broadcast(&ServerMessage::StreamStopped { user_id: party_id })
            .await;
    }

    /// Current publications, without side effects
    pub async fn list_active_publications(&self) -> Vec<ProducerInfo> {
        let mut publications: Vec<ProducerInfo> = self
            .registry
            .producers
            .list_all()
            .await
            .into_iter()
            .map(|(user_id, producer)| ProducerInfo {
                user_id,
                stream_id: producer.id().to_string(),
            })
            .collect();
        publications.sort_by_key(|p| p.user_id);
        publications
    }

    /// Answer a party's discovery request
    pub async fn discover(&self) -> Vec<ProducerInfo> {
        let publications = self.list_active_publications().await;

        if self.rebroadcast_on_discovery {
            for publication in &publications {
                self.broadcast_stream_available(&publication.stream_id, publication.user_id)
                    .await;
            }
        }

        publications
    }
}
