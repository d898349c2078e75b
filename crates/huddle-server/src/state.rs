use crate::registry::ResourceRegistry;
use crate::relay::{ListenConfig, MediaCodecConfig, RelayRouter};
use crate::sfu::{CapabilityService, FanOut, NegotiationCoordinator, SessionLifecycle};
use crate::ws::connections::ConnectionManager;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    /// Local address relay transports listen on
    pub listen_ip: String,
    /// Public address advertised to clients, when different from `listen_ip`
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub media_codecs: Vec<MediaCodecConfig>,
    /// Re-announce existing streams to everyone when a party lists them
    pub rebroadcast_on_discovery: bool,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            media_codecs: MediaCodecConfig::defaults(),
            rebroadcast_on_discovery: false,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load from an optional `huddle.toml` and `HUDDLE_*` environment variables
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("huddle").required(false))
            .add_source(config::Environment::with_prefix("HUDDLE").try_parsing(true))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn listen_config(&self) -> ListenConfig {
        ListenConfig {
            listen_ip: self.listen_ip.clone(),
            announced_ip: self.announced_ip.clone(),
            min_port: self.rtc_min_port,
            max_port: self.rtc_max_port,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub connections: Arc<ConnectionManager>,
    pub registry: Arc<ResourceRegistry>,
    pub capabilities: Arc<CapabilityService>,
    pub fanout: Arc<FanOut>,
    pub coordinator: Arc<NegotiationCoordinator>,
    pub lifecycle: Arc<SessionLifecycle>,
}

impl AppState {
    pub fn new(config: Config, router: Arc<dyn RelayRouter>) -> Self {
        let connections = Arc::new(ConnectionManager::new());
        let registry = Arc::new(ResourceRegistry::new());
        let capabilities = Arc::new(CapabilityService::new(router.as_ref()));
        let fanout = Arc::new(FanOut::new(
            connections.clone(),
            registry.clone(),
            config.rebroadcast_on_discovery,
        ));
        let coordinator = Arc::new(NegotiationCoordinator::new(
            router,
            registry.clone(),
            fanout.clone(),
            config.listen_config(),
        ));
        let lifecycle = Arc::new(SessionLifecycle::new(
            connections.clone(),
            registry.clone(),
            coordinator.clone(),
        ));

        Self {
            connections,
            registry,
            capabilities,
            fanout,
            coordinator,
            lifecycle,
        }
    }
}
