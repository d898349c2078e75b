//! Shared fixtures for the session orchestration tests

use super::{FanOut, NegotiationCoordinator, SessionLifecycle};
use crate::registry::ResourceRegistry;
use crate::relay::loopback::LoopbackRouter;
use crate::relay::{
    ListenConfig, MediaCodecConfig, RelayConsumer, RelayError, RelayProducer, RelayRouter,
    RelayTransport,
};
use crate::state::{AppState, Config};
use crate::ws::connections::ConnectionManager;
use async_trait::async_trait;
use huddle_protocol::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind, PartyId,
    RtpCapabilities, RtpCodecParameters, RtpEncodingParameters, RtpParameters, ServerMessage,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};

pub(crate) fn listen() -> ListenConfig {
    ListenConfig {
        listen_ip: "127.0.0.1".to_string(),
        announced_ip: None,
        min_port: 41000,
        max_port: 41099,
    }
}

pub(crate) fn vp8_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::new(),
        }],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(22_334_455),
            rid: None,
        }],
    }
}

pub(crate) fn client_dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AB:CD:EF".to_string(),
        }],
    }
}

/// Full application state over a loopback router bound to `port_range`
pub(crate) fn app_state(port_range: (u16, u16)) -> AppState {
    let config = Config {
        listen_ip: "127.0.0.1".to_string(),
        rtc_min_port: port_range.0,
        rtc_max_port: port_range.1,
        ..Config::default()
    };
    let router = Arc::new(LoopbackRouter::new(&config.media_codecs).unwrap());
    AppState::new(config, router)
}

/// Everything queued for a party so far
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(json) = rx.try_recv() {
        messages.push(serde_json::from_str(&json).expect("server message"));
    }
    messages
}

pub(crate) struct Harness {
    pub loopback: Arc<LoopbackRouter>,
    pub connections: Arc<ConnectionManager>,
    pub registry: Arc<ResourceRegistry>,
    pub coordinator: Arc<NegotiationCoordinator>,
    pub lifecycle: Arc<SessionLifecycle>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_listen(listen())
    }

    pub fn with_listen(listen: ListenConfig) -> Self {
        let loopback = Arc::new(LoopbackRouter::new(&MediaCodecConfig::defaults()).unwrap());
        Self::build(loopback.clone(), loopback, listen)
    }

    /// Harness whose relay calls go through `script`
    pub fn scripted(script: Arc<Script>) -> Self {
        let loopback = Arc::new(LoopbackRouter::new(&MediaCodecConfig::defaults()).unwrap());
        let router = Arc::new(ScriptedRouter {
            inner: loopback.clone(),
            script,
        });
        Self::build(loopback, router, listen())
    }

    fn build(
        loopback: Arc<LoopbackRouter>,
        router: Arc<dyn RelayRouter>,
        listen: ListenConfig,
    ) -> Self {
        let connections = Arc::new(ConnectionManager::new());
        let registry = Arc::new(ResourceRegistry::new());
        let fanout = Arc::new(FanOut::new(connections.clone(), registry.clone(), false));
        let coordinator = Arc::new(NegotiationCoordinator::new(
            router,
            registry.clone(),
            fanout,
            listen,
        ));
        let lifecycle = Arc::new(SessionLifecycle::new(
            connections.clone(),
            registry.clone(),
            coordinator.clone(),
        ));

        Self {
            loopback,
            connections,
            registry,
            coordinator,
            lifecycle,
        }
    }

    pub fn fanout(&self, rebroadcast_on_discovery: bool) -> FanOut {
        FanOut::new(
            self.connections.clone(),
            self.registry.clone(),
            rebroadcast_on_discovery,
        )
    }

    /// Connect a party and swallow its welcome message
    pub async fn connect(&self) -> (PartyId, mpsc::UnboundedReceiver<String>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let party_id = self.lifecycle.on_connect(tx).await;
        let welcome = drain(&mut rx);
        assert!(matches!(welcome.as_slice(), [ServerMessage::Welcome { user_id }] if *user_id == party_id));
        (party_id, rx)
    }

    pub async fn create_connected_transport(&self, party_id: PartyId) -> String {
        let transport = self.coordinator.create_transport(party_id).await.unwrap();
        self.coordinator
            .connect_transport(party_id, Some(&transport.id), client_dtls())
            .await
            .unwrap();
        transport.id
    }

    /// Create, connect and publish a video stream; returns the stream id
    pub async fn publish(&self, party_id: PartyId) -> String {
        let transport_id = self.create_connected_transport(party_id).await;
        self.coordinator
            .produce(
                party_id,
                Some(&transport_id),
                MediaKind::Video,
                vp8_parameters(),
            )
            .await
            .unwrap()
    }

    pub async fn loopback_ports_in_use(&self) -> usize {
        self.loopback.ports_in_use().await
    }
}

/// Parks the next transport call after the engine has answered, until opened
#[derive(Default)]
pub(crate) struct Gate {
    armed: AtomicBool,
    parked: Notify,
    open: Notify,
}

impl Gate {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until a call is parked at the gate
    pub async fn parked(&self) {
        self.parked.notified().await;
    }

    pub fn open(&self) {
        self.open.notify_one();
    }

    async fn pass(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.parked.notify_one();
            self.open.notified().await;
        }
    }
}

/// Records relay close calls and optionally makes them fail
#[derive(Default)]
pub(crate) struct Script {
    pub fail_close: AtomicBool,
    pub gate: Gate,
    log: Mutex<Vec<String>>,
}

impl Script {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, event: String) -> Result<(), RelayError> {
        self.log.lock().unwrap().push(event.clone());
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(RelayError::InvalidParameters(format!("scripted failure: {}", event)));
        }
        Ok(())
    }
}

struct ScriptedRouter {
    inner: Arc<LoopbackRouter>,
    script: Arc<Script>,
}

#[async_trait]
impl RelayRouter for ScriptedRouter {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.inner.rtp_capabilities()
    }

    async fn create_transport(
        &self,
        listen: &ListenConfig,
    ) -> Result<Arc<dyn RelayTransport>, RelayError> {
        let inner = self.inner.create_transport(listen).await?;
        Ok(Arc::new(ScriptedTransport {
            inner,
            script: self.script.clone(),
        }))
    }
}

struct ScriptedTransport {
    inner: Arc<dyn RelayTransport>,
    script: Arc<Script>,
}

#[async_trait]
impl RelayTransport for ScriptedTransport {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn ice_parameters(&self) -> IceParameters {
        self.inner.ice_parameters()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.inner.ice_candidates()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.inner.dtls_parameters()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), RelayError> {
        self.inner.connect(dtls_parameters).await?;
        self.script.gate.pass().await;
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn RelayProducer>, RelayError> {
        let inner = self.inner.produce(kind, rtp_parameters).await?;
        self.script.gate.pass().await;
        Ok(Arc::new(ScriptedProducer {
            inner,
            script: self.script.clone(),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn RelayConsumer>, RelayError> {
        let inner = self.inner.consume(producer_id, rtp_capabilities).await?;
        self.script.gate.pass().await;
        Ok(Arc::new(ScriptedConsumer {
            inner,
            script: self.script.clone(),
        }))
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.inner.close().await?;
        self.script.record(format!("transport:{}", self.inner.id()))
    }
}

struct ScriptedProducer {
    inner: Arc<dyn RelayProducer>,
    script: Arc<Script>,
}

#[async_trait]
impl RelayProducer for ScriptedProducer {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> MediaKind {
        self.inner.kind()
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.inner.rtp_parameters()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.inner.close().await?;
        self.script.record(format!("producer:{}", self.inner.id()))
    }
}

struct ScriptedConsumer {
    inner: Arc<dyn RelayConsumer>,
    script: Arc<Script>,
}

#[async_trait]
impl RelayConsumer for ScriptedConsumer {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn producer_id(&self) -> &str {
        self.inner.producer_id()
    }

    fn kind(&self) -> MediaKind {
        self.inner.kind()
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.inner.rtp_parameters()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.inner.close().await?;
        self.script.record(format!("consumer:{}", self.inner.id()))
    }
}
