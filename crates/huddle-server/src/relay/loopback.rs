//! Loopback relay engine
//!
//! Performs the negotiation half of an SFU engine in-process: port
//! allocation, ICE credentials, DTLS fingerprints, codec matching and the
//! close cascade between transports, producers and consumers. No packets are
//! forwarded, which makes it suitable for running the signaling server on its
//! own and for tests.

use super::{
    ListenConfig, MediaCodecConfig, RelayConsumer, RelayEngine, RelayError, RelayProducer,
    RelayRouter, RelayTransport, RelayWorker,
};
use async_trait::async_trait;
use huddle_protocol::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtcpFeedback, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters,
    RtpParameters,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

/// Host candidate priority for UDP (type preference 126, local preference 65535)
const HOST_CANDIDATE_PRIORITY: u32 = 1_076_302_079;

/// Creates loopback workers
#[derive(Debug, Default)]
pub struct LoopbackEngine;

impl LoopbackEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RelayEngine for LoopbackEngine {
    async fn create_worker(&self) -> Result<Arc<dyn RelayWorker>, RelayError> {
        let worker = LoopbackWorker {
            id: Uuid::new_v4().to_string(),
        };
        tracing::info!("Created loopback relay worker {}", worker.id);
        Ok(Arc::new(worker))
    }
}

pub struct LoopbackWorker {
    id: String,
}

#[async_trait]
impl RelayWorker for LoopbackWorker {
    async fn create_router(
        &self,
        media_codecs: &[MediaCodecConfig],
    ) -> Result<Arc<dyn RelayRouter>, RelayError> {
        let router = LoopbackRouter::new(media_codecs)?;
        tracing::info!(
            "Created loopback router {} on worker {} with {} codecs",
            router.shared.id,
            self.id,
            router.shared.codecs.len()
        );
        Ok(Arc::new(router))
    }
}

/// A codec entry of the router's codec table
struct RouterCodec {
    kind: RTPCodecType,
    parameters: RTCRtpCodecParameters,
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn media_kind(codec_type: RTPCodecType) -> Option<MediaKind> {
    match codec_type {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        _ => None,
    }
}

fn default_feedback(kind: MediaKind) -> Vec<RTCPFeedback> {
    match kind {
        MediaKind::Audio => vec![],
        MediaKind::Video => [("nack", ""), ("nack", "pli"), ("ccm", "fir"), ("goog-remb", "")]
            .into_iter()
            .map(|(typ, parameter)| RTCPFeedback {
                typ: typ.to_string(),
                parameter: parameter.to_string(),
            })
            .collect(),
    }
}

/// Split an fmtp line (`a=1;b=2`) into its key/value pairs
fn parse_fmtp(line: &str) -> BTreeMap<String, String> {
    line.split(';')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn build_codec_table(media_codecs: &[MediaCodecConfig]) -> Result<Vec<RouterCodec>, RelayError> {
    if media_codecs.is_empty() {
        return Err(RelayError::InvalidCodecConfig(
            "no media codecs configured".to_string(),
        ));
    }

    let mut payload_types = HashSet::new();
    let mut table = Vec::with_capacity(media_codecs.len());

    for codec in media_codecs {
        let prefix = format!("{}/", codec.kind);
        if !codec.mime_type.to_ascii_lowercase().starts_with(&prefix) {
            return Err(RelayError::InvalidCodecConfig(format!(
                "{} is not an {} codec",
                codec.mime_type, codec.kind
            )));
        }
        if codec.clock_rate == 0 {
            return Err(RelayError::InvalidCodecConfig(format!(
                "{} has no clock rate",
                codec.mime_type
            )));
        }
        if !payload_types.insert(codec.payload_type) {
            return Err(RelayError::InvalidCodecConfig(format!(
                "payload type {} used twice",
                codec.payload_type
            )));
        }

        table.push(RouterCodec {
            kind: codec_type(codec.kind),
            parameters: RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: codec.mime_type.clone(),
                    clock_rate: codec.clock_rate,
                    channels: codec.channels,
                    sdp_fmtp_line: codec.sdp_fmtp_line.clone(),
                    rtcp_feedback: default_feedback(codec.kind),
                },
                payload_type: codec.payload_type,
                ..Default::default()
            },
        });
    }

    Ok(table)
}

fn capabilities_of(table: &[RouterCodec]) -> RtpCapabilities {
    let codecs = table
        .iter()
        .filter_map(|codec| {
            let kind = media_kind(codec.kind)?;
            let capability = &codec.parameters.capability;
            Some(RtpCodecCapability {
                kind,
                mime_type: capability.mime_type.clone(),
                preferred_payload_type: codec.parameters.payload_type,
                clock_rate: capability.clock_rate,
                channels: (capability.channels > 0).then_some(capability.channels),
                parameters: parse_fmtp(&capability.sdp_fmtp_line),
                rtcp_feedback: capability
                    .rtcp_feedback
                    .iter()
                    .map(|fb| RtcpFeedback {
                        kind: fb.typ.clone(),
                        parameter: fb.parameter.clone(),
                    })
                    .collect(),
            })
        })
        .collect();

    RtpCapabilities { codecs }
}

fn same_codec(
    mime_type: &str,
    clock_rate: u32,
    channels: Option<u16>,
    other_mime_type: &str,
    other_clock_rate: u32,
    other_channels: Option<u16>,
) -> bool {
    mime_type.eq_ignore_ascii_case(other_mime_type)
        && clock_rate == other_clock_rate
        && channels.unwrap_or(1) == other_channels.unwrap_or(1)
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn random_ssrc() -> u32 {
    rand::thread_rng().gen_range(100_000_000..=999_999_999)
}

/// Returns the address to advertise in candidates
fn validate_listen(listen: &ListenConfig) -> Result<String, RelayError> {
    listen.listen_ip.parse::<IpAddr>().map_err(|_| {
        RelayError::InvalidListenConfig(format!("invalid listen ip {:?}", listen.listen_ip))
    })?;

    if let Some(announced) = &listen.announced_ip {
        announced.parse::<IpAddr>().map_err(|_| {
            RelayError::InvalidListenConfig(format!("invalid announced ip {:?}", announced))
        })?;
    }

    if listen.min_port == 0 || listen.min_port > listen.max_port {
        return Err(RelayError::InvalidListenConfig(format!(
            "invalid port range {}-{}",
            listen.min_port, listen.max_port
        )));
    }

    Ok(listen
        .announced_ip
        .clone()
        .unwrap_or_else(|| listen.listen_ip.clone()))
}

struct RouterShared {
    id: String,
    codecs: Vec<RouterCodec>,
    capabilities: RtpCapabilities,
    ports_in_use: Mutex<HashSet<u16>>,
    producers: RwLock<HashMap<String, Arc<LoopbackProducer>>>,
}

impl RouterShared {
    fn supports(&self, codec: &RtpCodecParameters) -> bool {
        self.codecs.iter().any(|entry| {
            let capability = &entry.parameters.capability;
            same_codec(
                &codec.mime_type,
                codec.clock_rate,
                codec.channels,
                &capability.mime_type,
                capability.clock_rate,
                (capability.channels > 0).then_some(capability.channels),
            )
        })
    }

    async fn allocate_port(&self, listen: &ListenConfig) -> Result<u16, RelayError> {
        let mut in_use = self.ports_in_use.lock().await;
        let port = (listen.min_port..=listen.max_port)
            .find(|port| !in_use.contains(port))
            .ok_or(RelayError::PortsExhausted {
                min: listen.min_port,
                max: listen.max_port,
            })?;
        in_use.insert(port);
        Ok(port)
    }

    async fn release_port(&self, port: u16) {
        self.ports_in_use.lock().await.remove(&port);
    }
}

pub struct LoopbackRouter {
    shared: Arc<RouterShared>,
}

impl LoopbackRouter {
    pub fn new(media_codecs: &[MediaCodecConfig]) -> Result<Self, RelayError> {
        let codecs = build_codec_table(media_codecs)?;
        let capabilities = capabilities_of(&codecs);

        Ok(Self {
            shared: Arc::new(RouterShared {
                id: Uuid::new_v4().to_string(),
                codecs,
                capabilities,
                ports_in_use: Mutex::new(HashSet::new()),
                producers: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Number of live producers across all transports of this router
    pub async fn producer_count(&self) -> usize {
        self.shared.producers.read().await.len()
    }

    pub async fn ports_in_use(&self) -> usize {
        self.shared.ports_in_use.lock().await.len()
    }
}

#[async_trait]
impl RelayRouter for LoopbackRouter {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.shared.capabilities.clone()
    }

    async fn create_transport(
        &self,
        listen: &ListenConfig,
    ) -> Result<Arc<dyn RelayTransport>, RelayError> {
        let candidate_ip = validate_listen(listen)?;
        let port = self.shared.allocate_port(listen).await?;

        let transport = LoopbackTransport::new(self.shared.clone(), candidate_ip, port);
        tracing::debug!(
            "Loopback router {} created transport {} on port {}",
            self.shared.id,
            transport.id,
            port
        );

        Ok(Arc::new(transport))
    }
}

#[derive(Default)]
struct TransportState {
    remote_dtls: Option<DtlsParameters>,
    closed: bool,
    producers: Vec<Arc<LoopbackProducer>>,
    consumers: Vec<Arc<LoopbackConsumer>>,
}

pub struct LoopbackTransport {
    id: String,
    port: u16,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    router: Arc<RouterShared>,
    next_mid: AtomicU32,
    state: Mutex<TransportState>,
}

impl LoopbackTransport {
    fn new(router: Arc<RouterShared>, candidate_ip: String, port: u16) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            port,
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: HOST_CANDIDATE_PRIORITY,
                ip: candidate_ip,
                protocol: "udp".to_string(),
                port,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
            router,
            next_mid: AtomicU32::new(0),
            state: Mutex::new(TransportState::default()),
        }
    }

    fn check_produce_parameters(
        &self,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<(), RelayError> {
        if rtp_parameters.codecs.is_empty() {
            return Err(RelayError::InvalidParameters(
                "rtp parameters carry no codecs".to_string(),
            ));
        }

        let prefix = format!("{}/", kind);
        for codec in &rtp_parameters.codecs {
            let mime = codec.mime_type.to_ascii_lowercase();
            if !mime.starts_with(&prefix) {
                return Err(RelayError::InvalidParameters(format!(
                    "{} codec {} does not match kind",
                    kind, codec.mime_type
                )));
            }
            // Retransmission entries ride along with a media codec
            if mime.ends_with("/rtx") {
                continue;
            }
            if !self.router.supports(codec) {
                return Err(RelayError::UnsupportedCodec(codec.mime_type.clone()));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl RelayTransport for LoopbackTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RelayError::TransportClosed(self.id.clone()));
        }
        if dtls_parameters.fingerprints.is_empty() {
            return Err(RelayError::InvalidParameters(
                "missing DTLS fingerprints".to_string(),
            ));
        }

        match &state.remote_dtls {
            Some(existing) if *existing == dtls_parameters => Ok(()),
            Some(_) => Err(RelayError::AlreadyConnected(self.id.clone())),
            None => {
                state.remote_dtls = Some(dtls_parameters);
                tracing::debug!("Loopback transport {} connected", self.id);
                Ok(())
            }
        }
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn RelayProducer>, RelayError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RelayError::TransportClosed(self.id.clone()));
        }
        self.check_produce_parameters(kind, &rtp_parameters)?;

        let producer = Arc::new(LoopbackProducer {
            id: Uuid::new_v4().to_string(),
            kind,
            rtp_parameters,
            closed: AtomicBool::new(false),
            router: Arc::downgrade(&self.router),
            consumers: Mutex::new(Vec::new()),
        });

        self.router
            .producers
            .write()
            .await
            .insert(producer.id.clone(), producer.clone());
        state.producers.retain(|p| !p.is_closed());
        state.producers.push(producer.clone());

        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn RelayConsumer>, RelayError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RelayError::TransportClosed(self.id.clone()));
        }

        let producer = self
            .router
            .producers
            .read()
            .await
            .get(producer_id)
            .cloned()
            .filter(|p| !p.is_closed())
            .ok_or_else(|| RelayError::ProducerNotFound(producer_id.to_string()))?;

        let source = producer
            .rtp_parameters
            .codecs
            .iter()
            .find(|codec| !codec.mime_type.to_ascii_lowercase().ends_with("/rtx"))
            .ok_or_else(|| RelayError::CannotConsume(producer_id.to_string()))?;

        let capability = rtp_capabilities
            .codecs
            .iter()
            .find(|cap| {
                cap.kind == producer.kind
                    && same_codec(
                        &source.mime_type,
                        source.clock_rate,
                        source.channels,
                        &cap.mime_type,
                        cap.clock_rate,
                        cap.channels,
                    )
            })
            .ok_or_else(|| RelayError::CannotConsume(producer_id.to_string()))?;

        let mid = self.next_mid.fetch_add(1, Ordering::Relaxed);
        let rtp_parameters = RtpParameters {
            mid: Some(mid.to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: source.mime_type.clone(),
                payload_type: capability.preferred_payload_type,
                clock_rate: source.clock_rate,
                channels: source.channels,
                parameters: source.parameters.clone(),
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(random_ssrc()),
                rid: None,
            }],
        };

        let consumer = Arc::new(LoopbackConsumer {
            id: Uuid::new_v4().to_string(),
            producer_id: producer.id.clone(),
            kind: producer.kind,
            rtp_parameters,
            closed: AtomicBool::new(false),
        });

        producer.attach(consumer.clone()).await;
        state.consumers.retain(|c| !c.is_closed());
        state.consumers.push(consumer.clone());

        Ok(consumer)
    }

    async fn close(&self) -> Result<(), RelayError> {
        let (producers, consumers) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            (
                std::mem::take(&mut state.producers),
                std::mem::take(&mut state.consumers),
            )
        };

        for consumer in consumers {
            consumer.mark_closed();
        }
        for producer in producers {
            producer.shutdown().await;
        }
        self.router.release_port(self.port).await;

        tracing::debug!("Loopback transport {} closed", self.id);
        Ok(())
    }
}

pub struct LoopbackProducer {
    id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    closed: AtomicBool,
    router: Weak<RouterShared>,
    consumers: Mutex<Vec<Arc<LoopbackConsumer>>>,
}

impl LoopbackProducer {
    async fn attach(&self, consumer: Arc<LoopbackConsumer>) {
        let mut consumers = self.consumers.lock().await;
        consumers.retain(|c| !c.is_closed());
        consumers.push(consumer);
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            router.producers.write().await.remove(&self.id);
        }
        for consumer in self.consumers.lock().await.drain(..) {
            consumer.mark_closed();
        }
    }
}

#[async_trait]
impl RelayProducer for LoopbackProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.shutdown().await;
        Ok(())
    }
}

pub struct LoopbackConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    closed: AtomicBool,
}

impl LoopbackConsumer {
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelayConsumer for LoopbackConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.mark_closed();
        Ok(())
    }
}
