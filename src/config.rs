use crate::dht::DhtConfig;
use crate::error::{HyphaError, Result};
use crate::identity::MasterSeed;
use crate::transport::VerificationPolicy;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the master seed comes from. With neither set a fresh random seed is used,
/// which gives the agent a new identity on every start.
#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct IdentityConfig {
    /// 64 hex chars.
    pub seed_hex: Option<String>,
    pub passphrase: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub host: String,
    pub port: u16,
    /// `host:port` entries; empty starts an isolated overlay.
    pub bootstrap: Vec<String>,
    pub default_topic: String,
    /// Advertised in our listing.
    pub capabilities: Vec<String>,
    pub timeout_seconds: u64,
    pub rpc_timeout_seconds: u64,
    pub ksize: usize,
    pub alpha: usize,
    pub storage_ttl_seconds: u64,
    /// Cap on values this node stores for the overlay.
    pub max_stored_keys: usize,
    pub reannounce_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Host written into our listings and `reply_to`; defaults to `host`.
    pub advertise_host: Option<String>,
    pub max_payload_bytes: usize,
    pub connect_timeout_seconds: u64,
    pub read_timeout_seconds: u64,
    pub verification: VerificationPolicy,
}

/// HTTP status endpoint of the node binary.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`.
    pub format: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8468,
            bootstrap: vec![],
            default_topic: "hypha-agents".to_string(),
            capabilities: vec![],
            timeout_seconds: 30,
            rpc_timeout_seconds: 5,
            ksize: 20,
            alpha: 3,
            storage_ttl_seconds: 7 * 24 * 3600,
            max_stored_keys: 10_000,
            reannounce_interval_seconds: 300,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8469,
            advertise_host: None,
            max_payload_bytes: 64 * 1024,
            connect_timeout_seconds: 10,
            read_timeout_seconds: 30,
            verification: VerificationPolicy::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8470,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("pretty".to_string()),
        }
    }
}

impl IdentityConfig {
    pub fn master_seed(&self) -> Result<MasterSeed> {
        match (&self.seed_hex, &self.passphrase) {
            (Some(hex_seed), _) => MasterSeed::from_hex(hex_seed),
            (None, Some(passphrase)) => MasterSeed::from_passphrase(passphrase),
            (None, None) => {
                tracing::warn!("No seed configured, generating an ephemeral identity");
                Ok(MasterSeed::random())
            }
        }
    }
}

impl DiscoveryConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn reannounce_interval(&self) -> Duration {
        Duration::from_secs(self.reannounce_interval_seconds)
    }

    pub fn dht_config(&self) -> Result<DhtConfig> {
        let bind_addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| HyphaError::Config(format!("Invalid discovery bind address: {}", e)))?;
        Ok(DhtConfig {
            bind_addr,
            ksize: self.ksize,
            alpha: self.alpha,
            rpc_timeout: Duration::from_secs(self.rpc_timeout_seconds),
            storage_ttl: Duration::from_secs(self.storage_ttl_seconds),
            max_stored_keys: self.max_stored_keys,
        })
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    pub fn advertised_host(&self) -> &str {
        self.advertise_host.as_deref().unwrap_or(&self.host)
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| HyphaError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| HyphaError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(seed) = std::env::var("HYPHA_SEED") {
            self.identity.seed_hex = Some(seed);
        }

        if let Ok(passphrase) = std::env::var("HYPHA_PASSPHRASE") {
            self.identity.passphrase = Some(passphrase);
        }

        if let Ok(topic) = std::env::var("HYPHA_DEFAULT_TOPIC") {
            self.discovery.default_topic = topic;
        }

        if let Ok(bootstrap) = std::env::var("HYPHA_BOOTSTRAP") {
            self.discovery.bootstrap = bootstrap
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(host) = std::env::var("HYPHA_ADVERTISE_HOST") {
            self.transport.advertise_host = Some(host);
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity.seed_hex.is_some() && self.identity.passphrase.is_some() {
            return Err(HyphaError::Config(
                "Set either identity.seed_hex or identity.passphrase, not both".to_string(),
            ));
        }
        if let Some(hex_seed) = &self.identity.seed_hex {
            MasterSeed::from_hex(hex_seed)?;
        }
        if let Some(passphrase) = &self.identity.passphrase {
            crate::validation::validate_passphrase(passphrase)?;
        }

        if self.discovery.default_topic.is_empty() {
            return Err(HyphaError::Config("Default topic cannot be empty".to_string()));
        }
        if self.discovery.ksize == 0 || self.discovery.alpha == 0 {
            return Err(HyphaError::Config("DHT ksize and alpha must be positive".to_string()));
        }
        if self.discovery.max_stored_keys == 0 {
            return Err(HyphaError::Config("DHT max_stored_keys must be positive".to_string()));
        }
        if self.discovery.timeout_seconds == 0 || self.discovery.rpc_timeout_seconds == 0 {
            return Err(HyphaError::Config("Discovery timeouts cannot be 0".to_string()));
        }
        for entry in &self.discovery.bootstrap {
            let valid_port = entry
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid_port {
                return Err(HyphaError::Config(format!(
                    "Bootstrap entry '{}' must be host:port",
                    entry
                )));
            }
        }
        self.discovery.dht_config()?;

        if self.transport.max_payload_bytes < 1024 {
            return Err(HyphaError::Config(
                "Transport max_payload_bytes must be at least 1024".to_string(),
            ));
        }
        if self.transport.connect_timeout_seconds == 0 || self.transport.read_timeout_seconds == 0 {
            return Err(HyphaError::Config("Transport timeouts cannot be 0".to_string()));
        }
        let advertised = self.transport.advertised_host();
        let unspecified = advertised
            .parse::<IpAddr>()
            .map(|ip| ip.is_unspecified())
            .unwrap_or(false);
        if advertised.is_empty() || unspecified {
            return Err(HyphaError::Config(format!(
                "Transport host '{}' is not reachable by peers; set transport.advertise_host",
                advertised
            )));
        }

        match self.logging.format.as_deref() {
            None | Some("pretty") | Some("json") => {}
            Some(other) => {
                return Err(HyphaError::Config(format!("Unknown log format '{}'", other)));
            }
        }

        Ok(())
    }

    pub fn get_transport_address(&self) -> String {
        format!("{}:{}", self.transport.host, self.transport.port)
    }

    pub fn get_server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| HyphaError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| HyphaError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}

/// Install the global tracing subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| HyphaError::Config(format!("Invalid log level '{}': {}", config.level, e)))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let installed = match config.format.as_deref() {
        Some("json") => builder.json().try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|e| HyphaError::Config(format!("Failed to initialise logging: {}", e)))
}
