//! Relay engine seam
//!
//! The media relay (ICE, DTLS, RTP forwarding) is an external collaborator.
//! The signaling core only talks to it through these traits, mirroring the
//! worker → router → transport → producer/consumer object model of common SFU
//! engines. [`loopback`] provides an in-process engine that negotiates but
//! moves no media.

pub mod loopback;

use async_trait::async_trait;
use huddle_protocol::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

pub use loopback::LoopbackEngine;

/// Failures reported by the relay engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("invalid listen configuration: {0}")]
    InvalidListenConfig(String),

    #[error("no free port in range {min}-{max}")]
    PortsExhausted { min: u16, max: u16 },

    #[error("invalid media codec configuration: {0}")]
    InvalidCodecConfig(String),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("transport {0} is closed")]
    TransportClosed(String),

    #[error("transport {0} already connected with different DTLS parameters")]
    AlreadyConnected(String),

    #[error("producer {0} not found")]
    ProducerNotFound(String),

    #[error("cannot consume producer {0} with the given capabilities")]
    CannotConsume(String),
}

/// Where a transport listens for media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenConfig {
    pub listen_ip: String,
    /// Address advertised in ICE candidates, for hosts behind NAT
    pub announced_ip: Option<String>,
    pub min_port: u16,
    pub max_port: u16,
}

/// A codec the router is configured with at start-up
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MediaCodecConfig {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default)]
    pub channels: u16,
    #[serde(default)]
    pub sdp_fmtp_line: String,
    pub payload_type: u8,
}

impl MediaCodecConfig {
    /// Codec set offered when nothing else is configured
    pub fn defaults() -> Vec<Self> {
        vec![
            MediaCodecConfig {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                payload_type: 111,
            },
            MediaCodecConfig {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                payload_type: 96,
            },
            // Baseline profile, level 3.1 (720p30)
            MediaCodecConfig {
                kind: MediaKind::Video,
                mime_type: "video/H264".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_string(),
                payload_type: 102,
            },
        ]
    }
}

#[async_trait]
pub trait RelayEngine: Send + Sync {
    async fn create_worker(&self) -> Result<Arc<dyn RelayWorker>, RelayError>;
}

#[async_trait]
pub trait RelayWorker: Send + Sync {
    async fn create_router(
        &self,
        media_codecs: &[MediaCodecConfig],
    ) -> Result<Arc<dyn RelayRouter>, RelayError>;
}

#[async_trait]
pub trait RelayRouter: Send + Sync {
    fn id(&self) -> &str;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(
        &self,
        listen: &ListenConfig,
    ) -> Result<Arc<dyn RelayTransport>, RelayError>;
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    fn id(&self) -> &str;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> Vec<IceCandidate>;

    fn dtls_parameters(&self) -> DtlsParameters;

    /// Must be idempotent for repeated calls with the same parameters
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), RelayError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn RelayProducer>, RelayError>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn RelayConsumer>, RelayError>;

    /// Closes the transport and everything produced or consumed through it
    async fn close(&self) -> Result<(), RelayError>;
}

#[async_trait]
pub trait RelayProducer: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), RelayError>;
}

#[async_trait]
pub trait RelayConsumer: Send + Sync {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    /// True once the consumer, its transport, or its producer has closed
    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), RelayError>;
}
