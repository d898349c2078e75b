//! Session Lifecycle Manager
//!
//! Connect and disconnect hooks for parties. Releasing a party always runs
//! the same ordered sequence: published stream, subscribed stream, transport.
//! A failure closing one resource at the relay is logged and recorded, and
//! the remaining steps still run. Registry entries are dropped regardless.

use super::{NegotiationCoordinator, Released};
use crate::registry::ResourceRegistry;
use crate::relay::RelayError;
use crate::ws::connections::ConnectionManager;
use huddle_protocol::{PartyId, ServerMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleasedResource {
    PublishedStream(String),
    SubscribedStream(String),
    Transport(String),
}

/// What a release pass removed, in removal order
#[derive(Debug, Default)]
pub struct ReleaseReport {
    pub released: Vec<ReleasedResource>,
    pub failures: Vec<(ReleasedResource, RelayError)>,
}

impl ReleaseReport {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty()
    }

    fn record(&mut self, released: Option<Released>, wrap: fn(String) -> ReleasedResource) {
        if let Some(Released { id, error }) = released {
            let resource = wrap(id);
            if let Some(e) = error {
                self.failures.push((resource.clone(), e));
            }
            self.released.push(resource);
        }
    }
}

pub struct SessionLifecycle {
    connections: Arc<ConnectionManager>,
    registry: Arc<ResourceRegistry>,
    coordinator: Arc<NegotiationCoordinator>,
}

impl SessionLifecycle {
    pub fn new(
        connections: Arc<ConnectionManager>,
        registry: Arc<ResourceRegistry>,
        coordinator: Arc<NegotiationCoordinator>,
    ) -> Self {
        Self {
            connections,
            registry,
            coordinator,
        }
    }

    /// Assign a party id and register its outbound queue
    ///
    /// The welcome message is queued before the party becomes visible to
    /// broadcasts, so it is always the first thing the party receives.
    pub async fn on_connect(&self, sender: mpsc::UnboundedSender<String>) -> PartyId {
        let party_id = Uuid::new_v4();

        match serde_json::to_string(&ServerMessage::Welcome { user_id: party_id }) {
            Ok(json) => {
                if sender.send(json).is_err() {
                    tracing::warn!("Party {} went away before welcome", party_id);
                }
            }
            Err(e) => tracing::error!("Failed to serialize welcome: {}", e),
        }

        self.connections.add_connection(party_id, sender).await;
        tracing::info!("Party {} connected", party_id);
        party_id
    }

    pub async fn on_disconnect(&self, party_id: PartyId) -> ReleaseReport {
        self.connections.remove_connection(party_id).await;
        let report = self.release(party_id).await;

        tracing::info!(
            "Party {} disconnected, released {} resources ({} relay failures)",
            party_id,
            report.released.len(),
            report.failures.len()
        );
        report
    }

    /// Release everything the party holds
    pub async fn release(&self, party_id: PartyId) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        report.record(
            self.coordinator.release_published(party_id).await,
            ReleasedResource::PublishedStream,
        );
        report.record(
            self.coordinator.release_subscribed(party_id).await,
            ReleasedResource::SubscribedStream,
        );
        report.record(
            self.coordinator.release_transport(party_id).await,
            ReleasedResource::Transport,
        );

        report
    }

    /// Release every party still holding resources; returns how many there were
    pub async fn shutdown(&self) -> usize {
        let parties = self.registry.parties().await;
        for party_id in &parties {
            self.release(*party_id).await;
        }
        if !parties.is_empty() {
            tracing::info!("Released resources of {} parties at shutdown", parties.len());
        }
        parties.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::testing::{Harness, Script, drain};
    use std::sync::atomic::Ordering;

    /// Party holding a transport, a published stream and a subscription
    async fn fully_negotiated(harness: &Harness) -> (PartyId, mpsc::UnboundedReceiver<String>, String) {
        let (party, mut rx) = harness.connect().await;
        let stream_id = harness.publish(party).await;
        harness
            .coordinator
            .consume(party, None, &stream_id, None)
            .await
            .unwrap();
        drain(&mut rx);
        (party, rx, stream_id)
    }

    #[tokio::test]
    async fn test_disconnect_releases_in_order() {
        let script = Arc::new(Script::default());
        let harness = Harness::scripted(script.clone());
        let (observer, mut observer_rx) = harness.connect().await;
        let (party, _rx, stream_id) = fully_negotiated(&harness).await;
        drain(&mut observer_rx);

        let transport_id = harness.registry.transports.get(party).await.unwrap().id().to_string();
        let consumer_id = harness.registry.consumers.get(party).await.unwrap().id().to_string();

        let report = harness.lifecycle.on_disconnect(party).await;

        assert_eq!(
            report.released,
            vec![
                ReleasedResource::PublishedStream(stream_id.clone()),
                ReleasedResource::SubscribedStream(consumer_id),
                ReleasedResource::Transport(transport_id.clone()),
            ]
        );
        assert!(report.failures.is_empty());
        assert_eq!(harness.registry.entry_count(party).await, 0);
        assert_eq!(
            script.log(),
            vec![format!("producer:{}", stream_id), format!("transport:{}", transport_id)]
        );

        let events = drain(&mut observer_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ServerMessage::StreamStopped { user_id } if *user_id == party));
        assert!(!harness.connections.is_connected(party).await);
        assert!(harness.connections.is_connected(observer).await);
    }

    #[tokio::test]
    async fn test_relay_failures_do_not_stop_cleanup() {
        let script = Arc::new(Script::default());
        let harness = Harness::scripted(script.clone());
        let (party, _rx, _stream_id) = fully_negotiated(&harness).await;
        script.fail_close.store(true, Ordering::SeqCst);

        let report = harness.lifecycle.release(party).await;

        assert_eq!(report.released.len(), 3);
        assert_eq!(report.failures.len(), 2);
        assert!(matches!(report.failures[0].0, ReleasedResource::PublishedStream(_)));
        assert!(matches!(report.failures[1].0, ReleasedResource::Transport(_)));
        assert_eq!(harness.registry.entry_count(party).await, 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let harness = Harness::new();
        let (party, mut rx, _) = fully_negotiated(&harness).await;

        assert_eq!(harness.lifecycle.release(party).await.released.len(), 3);
        drain(&mut rx);

        let second = harness.lifecycle.release(party).await;
        assert!(second.is_empty());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(harness.loopback_ports_in_use().await, 0);
    }

    #[tokio::test]
    async fn test_release_without_resources_is_noop() {
        let harness = Harness::new();
        let (party, mut rx) = harness.connect().await;

        let report = harness.lifecycle.on_disconnect(party).await;
        assert!(report.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_subscription_dangles_after_publisher_leaves() {
        let harness = Harness::new();
        let (alice, _alice_rx) = harness.connect().await;
        let (bob, _bob_rx) = harness.connect().await;
        let stream_id = harness.publish(alice).await;
        harness.coordinator.create_transport(bob).await.unwrap();
        harness.coordinator.consume(bob, None, &stream_id, None).await.unwrap();

        harness.lifecycle.on_disconnect(alice).await;

        let subscription = harness.registry.consumers.get(bob).await.unwrap();
        assert!(subscription.is_closed());

        let report = harness.lifecycle.on_disconnect(bob).await;
        assert_eq!(report.released.len(), 2);
        assert_eq!(harness.registry.consumers.len().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_every_party() {
        let harness = Harness::new();
        let (alice, _alice_rx) = harness.connect().await;
        let (bob, _bob_rx) = harness.connect().await;
        harness.publish(alice).await;
        harness.coordinator.create_transport(bob).await.unwrap();

        assert_eq!(harness.lifecycle.shutdown().await, 2);
        assert!(harness.registry.parties().await.is_empty());
        assert_eq!(harness.loopback_ports_in_use().await, 0);
        assert_eq!(harness.lifecycle.shutdown().await, 0);
    }
}
