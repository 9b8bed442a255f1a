//! Node configuration
//!
//! JSON file with every section defaulted, so a partial file (or none at
//! all) yields a runnable node. Environment overrides are applied on top.

use crate::constants::*;
use crate::error::ConfigError;
use crate::routing::RoutingStrategy;
use crate::topology::ScoringWeights;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_NODE_ID: &str = "SYNAPSE_NODE_ID";
pub const ENV_PORT: &str = "SYNAPSE_PORT";
pub const ENV_LOG_LEVEL: &str = "SYNAPSE_LOG_LEVEL";
pub const ENV_BOOTSTRAP: &str = "SYNAPSE_BOOTSTRAP";

const VALID_LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub p2p: P2pConfig,
    pub topology: TopologyConfig,
    pub routing: RoutingConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// UUID; generated at startup when absent
    pub id: Option<String>,
    pub name: String,
    /// PKCS#8 PEM; an ephemeral key is used when absent
    pub key_file: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            id: None,
            name: "synapse-node".to_string(),
            key_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub listen_host: String,
    /// 0 binds an ephemeral port
    pub listen_port: u16,
    pub bootstrap_peers: Vec<String>,
    pub max_peers: usize,
    pub max_connections: usize,
    pub message_queue_size: usize,
    pub max_message_size: usize,
    pub enable_discovery: bool,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub dial_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub handshake_tolerance_secs: i64,
    pub sweep_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub bootstrap_retries: u32,
    pub bootstrap_retry_delay_ms: u64,
}

impl Default for P2pConfig {
    fn default() -> Self {
        P2pConfig {
            listen_host: DEFAULT_LISTEN_HOST.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            bootstrap_peers: Vec::new(),
            max_peers: DEFAULT_MAX_PEERS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            message_queue_size: DEFAULT_MESSAGE_QUEUE_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
            enable_discovery: false,
            read_timeout_secs: DEFAULT_READ_TIMEOUT.as_secs(),
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT.as_secs(),
            dial_timeout_secs: DEFAULT_DIAL_TIMEOUT.as_secs(),
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
            handshake_tolerance_secs: HANDSHAKE_TOLERANCE_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
            bootstrap_retries: DEFAULT_MAX_RETRIES,
            bootstrap_retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
        }
    }
}

impl P2pConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn bootstrap_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bootstrap_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub mesh_threshold: usize,
    pub weights: ScoringWeights,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        TopologyConfig {
            mesh_threshold: DEFAULT_MESH_THRESHOLD,
            weights: ScoringWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub strategy: RoutingStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    /// Status API is served only when set
    pub port: Option<u16>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            host: "127.0.0.1".to_string(),
            port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// `~/.synapse/config.json`
    pub fn default_path() -> PathBuf {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        home.join(".synapse").join("config.json")
    }

    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p2p = &self.p2p;
        if p2p.listen_port != 0 && p2p.listen_port < 1024 {
            return Err(ConfigError::Invalid(format!(
                "invalid P2P listen port: {} (use 0 or >= 1024)",
                p2p.listen_port
            )));
        }
        if p2p.max_peers < 1 {
            return Err(ConfigError::Invalid("max_peers must be at least 1".into()));
        }
        if p2p.max_connections < 1 {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if p2p.message_queue_size < 1 {
            return Err(ConfigError::Invalid("message_queue_size must be at least 1".into()));
        }
        if p2p.max_message_size < 1 {
            return Err(ConfigError::Invalid("max_message_size must be at least 1".into()));
        }
        if p2p.handshake_tolerance_secs < 0 {
            return Err(ConfigError::Invalid("handshake_tolerance_secs cannot be negative".into()));
        }
        let timeouts = [
            ("read_timeout_secs", p2p.read_timeout_secs),
            ("write_timeout_secs", p2p.write_timeout_secs),
            ("dial_timeout_secs", p2p.dial_timeout_secs),
            ("handshake_timeout_secs", p2p.handshake_timeout_secs),
            ("sweep_interval_secs", p2p.sweep_interval_secs),
            ("heartbeat_interval_secs", p2p.heartbeat_interval_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} cannot be 0", name)));
            }
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!("invalid log level: {}", self.logging.level)));
        }

        self.topology.weights.validate().map_err(ConfigError::Invalid)?;
        if self.topology.mesh_threshold < 3 {
            return Err(ConfigError::Invalid("mesh_threshold must be at least 3".into()));
        }

        if let Some(id) = &self.node.id {
            uuid::Uuid::parse_str(id)
                .map_err(|e| ConfigError::Invalid(format!("node id {:?} is not a UUID: {}", id, e)))?;
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup(ENV_NODE_ID).filter(|v| !v.is_empty()) {
            self.node.id = Some(id);
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.p2p.listen_port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{}={} is not a port", ENV_PORT, port)))?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level.trim().to_ascii_lowercase();
        }
        if let Some(list) = lookup(ENV_BOOTSTRAP) {
            self.p2p.bootstrap_peers = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }
}
