//! Negotiation Coordinator
//!
//! Drives each party through transport creation, transport connection and
//! stream publication/subscription. Preconditions are checked against the
//! registry before calling into the relay engine, and re-checked after the
//! call returns, since the party's entries may have been released while the
//! engine call was suspended.

use super::FanOut;
use crate::error::{AppError, Result};
use crate::registry::{ResourceRegistry, TransportEntry, TransportState};
use crate::relay::{ListenConfig, RelayError, RelayRouter, RelayTransport};
use huddle_protocol::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, PartyId, RtpCapabilities,
    RtpParameters,
};
use serde::Serialize;
use std::sync::Arc;

/// Where a party stands in the negotiation sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NegotiationState {
    NoTransport,
    /// `consume` is allowed before connecting, so a subscription may exist here
    TransportCreated { subscribing: bool },
    TransportConnected { publishing: bool, subscribing: bool },
}

#[derive(Debug, Clone)]
pub struct TransportDescriptor {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl TransportDescriptor {
    fn of(transport: &dyn RelayTransport) -> Self {
        Self {
            id: transport.id().to_string(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerDescriptor {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// A resource taken out of the registry, with the engine's close result
#[derive(Debug)]
pub struct Released {
    pub id: String,
    pub error: Option<RelayError>,
}

pub struct NegotiationCoordinator {
    router: Arc<dyn RelayRouter>,
    registry: Arc<ResourceRegistry>,
    fanout: Arc<FanOut>,
    listen: ListenConfig,
}

impl NegotiationCoordinator {
    pub fn new(
        router: Arc<dyn RelayRouter>,
        registry: Arc<ResourceRegistry>,
        fanout: Arc<FanOut>,
        listen: ListenConfig,
    ) -> Self {
        Self {
            router,
            registry,
            fanout,
            listen,
        }
    }

    pub async fn negotiation_state(&self, party_id: PartyId) -> NegotiationState {
        match self.registry.transports.get(party_id).await {
            None => NegotiationState::NoTransport,
            Some(entry) if entry.state == TransportState::Created => {
                NegotiationState::TransportCreated {
                    subscribing: self.registry.consumers.contains(party_id).await,
                }
            }
            Some(_) => NegotiationState::TransportConnected {
                publishing: self.registry.producers.contains(party_id).await,
                subscribing: self.registry.consumers.contains(party_id).await,
            },
        }
    }

    pub async fn create_transport(&self, party_id: PartyId) -> Result<TransportDescriptor> {
        if let Some(existing) = self.registry.transports.get(party_id).await {
            return Err(AppError::AlreadyExists(format!(
                "party {} already holds transport {}",
                party_id,
                existing.id()
            )));
        }

        let transport = self.router.create_transport(&self.listen).await?;
        let descriptor = TransportDescriptor::of(transport.as_ref());

        if let Err(entry) = self
            .registry
            .transports
            .insert_if_absent(party_id, TransportEntry::new(transport))
            .await
        {
            // Another request registered a transport while we were allocating
            if let Err(e) = entry.transport.close().await {
                tracing::warn!("Failed to close surplus transport {}: {}", entry.id(), e);
            }
            return Err(AppError::AlreadyExists(format!(
                "party {} already holds a transport",
                party_id
            )));
        }

        tracing::info!("Created transport {} for party {}", descriptor.id, party_id);
        Ok(descriptor)
    }

    pub async fn connect_transport(
        &self,
        party_id: PartyId,
        transport_id: Option<&str>,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let entry = self.registered_transport(party_id, transport_id).await?;
        entry.transport.connect(dtls_parameters).await?;

        let connected_id = entry.id().to_string();
        let updated = self
            .registry
            .transports
            .update(party_id, |current| {
                if current.id() != connected_id.as_str() {
                    return false;
                }
                current.state = TransportState::Connected;
                true
            })
            .await;

        if !updated {
            return Err(AppError::NotFound(format!(
                "transport {} was released while connecting",
                connected_id
            )));
        }

        tracing::info!("Transport {} of party {} connected", connected_id, party_id);
        Ok(())
    }

    pub async fn produce(
        &self,
        party_id: PartyId,
        transport_id: Option<&str>,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String> {
        let entry = self.registered_transport(party_id, transport_id).await?;
        if entry.state != TransportState::Connected {
            return Err(AppError::BadRequest(format!(
                "transport {} is not connected",
                entry.id()
            )));
        }

        let producer = entry.transport.produce(kind, rtp_parameters).await?;

        if !self.still_registered(party_id, entry.id()).await {
            if let Err(e) = producer.close().await {
                tracing::warn!("Failed to close orphaned stream {}: {}", producer.id(), e);
            }
            return Err(AppError::NotFound(format!(
                "transport {} was released while producing",
                entry.id()
            )));
        }

        if let Some(previous) = self.registry.producers.put(party_id, producer.clone()).await {
            tracing::info!(
                "Party {} replaced stream {} with {}",
                party_id,
                previous.id(),
                producer.id()
            );
            if let Err(e) = previous.close().await {
                tracing::warn!("Failed to close replaced stream {}: {}", previous.id(), e);
            }
            self.fanout.broadcast_stream_removed(party_id).await;
        }

        tracing::info!(
            "Party {} publishing {} stream {}",
            party_id,
            kind,
            producer.id()
        );
        self.fanout
            .broadcast_stream_available(producer.id(), party_id)
            .await;

        Ok(producer.id().to_string())
    }

    /// Subscribe the party to a published stream
    ///
    /// Only a registered transport is required here, connected or not.
    pub async fn consume(
        &self,
        party_id: PartyId,
        transport_id: Option<&str>,
        target_stream_id: &str,
        rtp_capabilities: Option<RtpCapabilities>,
    ) -> Result<ConsumerDescriptor> {
        let entry = self.registered_transport(party_id, transport_id).await?;

        let published = self
            .registry
            .producers
            .list_all()
            .await
            .iter()
            .any(|(_, producer)| producer.id() == target_stream_id);
        if !published {
            return Err(AppError::NotFound(format!(
                "stream {} not found",
                target_stream_id
            )));
        }

        let rtp_capabilities = rtp_capabilities.unwrap_or_else(|| self.router.rtp_capabilities());
        let consumer = entry
            .transport
            .consume(target_stream_id, &rtp_capabilities)
            .await
            .map_err(|e| match e {
                RelayError::ProducerNotFound(id) => {
                    AppError::NotFound(format!("stream {} not found", id))
                }
                other => other.into(),
            })?;

        if !self.still_registered(party_id, entry.id()).await {
            if let Err(e) = consumer.close().await {
                tracing::warn!("Failed to close orphaned subscription {}: {}", consumer.id(), e);
            }
            return Err(AppError::NotFound(format!(
                "transport {} was released while consuming",
                entry.id()
            )));
        }

        if let Some(previous) = self.registry.consumers.put(party_id, consumer.clone()).await {
            tracing::info!(
                "Party {} replaced subscription {} with {}",
                party_id,
                previous.id(),
                consumer.id()
            );
            if let Err(e) = previous.close().await {
                tracing::warn!("Failed to close replaced subscription {}: {}", previous.id(), e);
            }
        }

        tracing::info!(
            "Party {} subscribed to stream {} ({})",
            party_id,
            target_stream_id,
            consumer.id()
        );

        Ok(ConsumerDescriptor {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        })
    }

    /// Stop the party's published stream; `Ok(false)` when nothing was published
    pub async fn stop_producing(&self, party_id: PartyId) -> Result<bool> {
        self.registered_transport(party_id, None).await?;
        Ok(self.release_published(party_id).await.is_some())
    }

    pub(crate) async fn release_published(&self, party_id: PartyId) -> Option<Released> {
        let producer = self.registry.producers.remove(party_id).await?;
        let error = producer.close().await.err();
        if let Some(e) = &error {
            tracing::warn!(
                "Failed to close stream {} of party {}: {}",
                producer.id(),
                party_id,
                e
            );
        }

        self.fanout.broadcast_stream_removed(party_id).await;
        tracing::info!("Released stream {} of party {}", producer.id(), party_id);

        Some(Released {
            id: producer.id().to_string(),
            error,
        })
    }

    /// Subscriptions are invisible to other parties, so nothing is announced
    pub(crate) async fn release_subscribed(&self, party_id: PartyId) -> Option<Released> {
        let consumer = self.registry.consumers.remove(party_id).await?;
        tracing::info!("Released subscription {} of party {}", consumer.id(), party_id);

        Some(Released {
            id: consumer.id().to_string(),
            error: None,
        })
    }

    pub(crate) async fn release_transport(&self, party_id: PartyId) -> Option<Released> {
        let entry = self.registry.transports.remove(party_id).await?;
        let error = entry.transport.close().await.err();
        if let Some(e) = &error {
            tracing::warn!(
                "Failed to close transport {} of party {}: {}",
                entry.id(),
                party_id,
                e
            );
        }
        tracing::info!("Released transport {} of party {}", entry.id(), party_id);

        Some(Released {
            id: entry.id().to_string(),
            error,
        })
    }

    async fn registered_transport(
        &self,
        party_id: PartyId,
        transport_id: Option<&str>,
    ) -> Result<TransportEntry> {
        let entry = self
            .registry
            .transports
            .get(party_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("no transport for party {}", party_id)))?;

        match transport_id {
            Some(id) if id != entry.id() => Err(AppError::NotFound(format!(
                "transport {} not found",
                id
            ))),
            _ => Ok(entry),
        }
    }

    async fn still_registered(&self, party_id: PartyId, transport_id: &str) -> bool {
        self.registry
            .transports
            .get(party_id)
            .await
            .is_some_and(|entry| entry.id() == transport_id)
    }
}
