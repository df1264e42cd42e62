use crate::auth::DeviceAuthenticator;
use crate::directory::{DeviceRecord, Directory, MemoryDirectory};
use crate::relay::{
    CaptureSettings, ConcurrencyGate, ConnectionManager, ManagerSettings, NameCachePolicy,
    PersonNameResolver, RecognitionBackend, RecognitionDispatcher, SessionFactory,
};
use crate::ws::{BroadcastHub, RoutingPolicy};
use facerelay_protocol::DeviceClass;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A device registered in the config file instead of the database
#[derive(Debug, Clone, Deserialize)]
pub struct StaticDevice {
    pub device_id: String,
    /// Argon2 PHC string, e.g. from `facerelay-server hash-secret`
    pub secret_hash: String,
    pub class: DeviceClass,
    #[serde(default = "default_true")]
    pub approved: bool,
    #[serde(default)]
    pub recognition_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Postgres directory; without it devices and persons come from this file
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    #[serde(default = "default_recognition_endpoint")]
    pub default_recognition_endpoint: String,
    #[serde(default = "default_ice_gather_timeout_ms")]
    pub ice_gather_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_gate_capacity")]
    pub gate_capacity: usize,
    #[serde(default = "default_shed_threshold")]
    pub shed_threshold: usize,
    #[serde(default = "default_frame_wait_ms")]
    pub frame_wait_ms: u64,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_recognition_timeout_ms")]
    pub recognition_timeout_ms: u64,
    #[serde(default = "default_no_match_log_interval_ms")]
    pub no_match_log_interval_ms: u64,
    #[serde(default)]
    pub publish_frames: bool,
    #[serde(default = "default_frame_preview_quality")]
    pub frame_preview_quality: u8,
    #[serde(default)]
    pub name_cache_max_entries: Option<usize>,
    #[serde(default)]
    pub name_cache_ttl_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub anonymous_fallback: bool,
    #[serde(default)]
    pub devices: Vec<StaticDevice>,
    /// Identity -> display name
    #[serde(default)]
    pub persons: HashMap<String, String>,
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_max_connections() -> u32 {
    5
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_recognition_endpoint() -> String {
    "http://localhost:5000/v1/vision/face/recognize".to_string()
}

fn default_ice_gather_timeout_ms() -> u64 {
    10_000
}

fn default_max_connections() -> usize {
    16
}

fn default_gate_capacity() -> usize {
    10
}

fn default_shed_threshold() -> usize {
    20
}

fn default_frame_wait_ms() -> u64 {
    5_000
}

fn default_sample_interval_ms() -> u64 {
    1_000
}

fn default_recognition_timeout_ms() -> u64 {
    10_000
}

fn default_no_match_log_interval_ms() -> u64 {
    30_000
}

fn default_frame_preview_quality() -> u8 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            database_url: None,
            database_max_connections: default_database_max_connections(),
            stun_servers: default_stun_servers(),
            default_recognition_endpoint: default_recognition_endpoint(),
            ice_gather_timeout_ms: default_ice_gather_timeout_ms(),
            max_connections: default_max_connections(),
            gate_capacity: default_gate_capacity(),
            shed_threshold: default_shed_threshold(),
            frame_wait_ms: default_frame_wait_ms(),
            sample_interval_ms: default_sample_interval_ms(),
            recognition_timeout_ms: default_recognition_timeout_ms(),
            no_match_log_interval_ms: default_no_match_log_interval_ms(),
            publish_frames: false,
            frame_preview_quality: default_frame_preview_quality(),
            name_cache_max_entries: None,
            name_cache_ttl_secs: None,
            anonymous_fallback: true,
            devices: Vec::new(),
            persons: HashMap::new(),
        }
    }
}

impl Config {
    /// Load `facerelay.toml` (optional), then `FACERELAY_*` environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(config::File::with_name("facerelay").required(false))
            .add_source(
                config::Environment::with_prefix("FACERELAY")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("stun_servers"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        if config.database_url.is_none() && config.devices.is_empty() {
            tracing::warn!("No database and no devices configured; every offer will be rejected");
        }
        Ok(config)
    }

    pub fn ice_gather_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gather_timeout_ms)
    }

    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_millis(self.recognition_timeout_ms)
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            frame_wait: Duration::from_millis(self.frame_wait_ms),
            sample_interval: Duration::from_millis(self.sample_interval_ms),
            publish_frames: self.publish_frames,
            preview_quality: self.frame_preview_quality,
            no_match_log_interval: Duration::from_millis(self.no_match_log_interval_ms),
        }
    }

    pub fn name_cache_policy(&self) -> NameCachePolicy {
        NameCachePolicy {
            max_entries: self.name_cache_max_entries,
            ttl: self.name_cache_ttl_secs.map(Duration::from_secs),
        }
    }

    pub fn routing_policy(&self) -> RoutingPolicy {
        if self.anonymous_fallback {
            RoutingPolicy::FallbackToAnonymous
        } else {
            RoutingPolicy::DeviceOnly
        }
    }

    /// Directory built from the `devices` and `persons` tables
    pub fn static_directory(&self) -> MemoryDirectory {
        let directory = self
            .devices
            .iter()
            .fold(MemoryDirectory::new(), |dir, device| {
                dir.with_device(DeviceRecord {
                    device_id: device.device_id.clone(),
                    secret_hash: device.secret_hash.clone(),
                    approved: device.approved,
                    class: device.class,
                    recognition_endpoint: device.recognition_endpoint.clone(),
                })
            });

        self.persons
            .iter()
            .fold(directory, |dir, (identity, name)| dir.with_person(identity, name))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<BroadcastHub>,
    pub gate: Arc<ConcurrencyGate>,
    pub authenticator: DeviceAuthenticator,
    pub manager: Arc<ConnectionManager>,
}

impl AppState {
    /// Wire the relay together. Must be called inside a tokio runtime.
    pub fn new(
        config: Config,
        directory: Arc<dyn Directory>,
        sessions: Arc<dyn SessionFactory>,
        backend: Arc<dyn RecognitionBackend>,
    ) -> Self {
        let hub = Arc::new(BroadcastHub::new(config.routing_policy()));
        let gate = Arc::new(ConcurrencyGate::new(
            config.gate_capacity,
            config.shed_threshold,
        ));
        let names = Arc::new(PersonNameResolver::new(
            directory.clone(),
            config.name_cache_policy(),
        ));
        let dispatcher = Arc::new(RecognitionDispatcher::new(
            backend,
            gate.clone(),
            names,
            hub.clone(),
            config.recognition_timeout(),
        ));
        let authenticator = DeviceAuthenticator::new(directory.clone());

        let manager = ConnectionManager::new(
            authenticator.clone(),
            directory,
            sessions,
            dispatcher,
            hub.clone(),
            ManagerSettings {
                max_connections: config.max_connections,
                default_endpoint: config.default_recognition_endpoint.clone(),
                capture: config.capture_settings(),
            },
        );

        Self {
            config: Arc::new(config),
            hub,
            gate,
            authenticator,
            manager,
        }
    }
}
