//! Configuration model for the proxy pool server.
//!
//! One YAML file describes the whole deployment: the dispatch mode, the
//! listeners, failure handling, virtual pools and where the upstream nodes
//! come from (inline array, external nodes file, remote subscriptions).
//! Loading applies defaults and validation; node-set normalisation (name
//! extraction, port assignment) lives in [`normalize`].

use std::collections::HashMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod nodes;
pub mod normalize;
pub mod persist;

pub use nodes::{NodeConfig, NodeSource};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("decode config: {0}")]
    Decode(#[from] serde_yaml::Error),
    #[error("config.nodes cannot be empty (configure nodes in config, nodes_file or subscriptions)")]
    NoNodes,
    #[error("node {index} is missing uri")]
    MissingUri { index: usize },
    #[error("no available ports found starting from {base}")]
    PortsExhausted { base: u16 },
    #[error("virtual_pools[{index}] {name:?}: {reason}")]
    VirtualPool {
        index: usize,
        name: String,
        reason: String,
    },
    #[error("nodes file {path}: {source}")]
    NodesFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config file path is unknown")]
    NoPath,
}

/// Dispatch mode of the whole server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    #[serde(rename = "pool")]
    Pool,
    #[serde(rename = "multi-port", alias = "multi_port")]
    MultiPort,
    #[serde(rename = "hybrid")]
    Hybrid,
}

impl Mode {
    /// Per-node listeners exist in multi-port and hybrid modes.
    pub fn has_node_listeners(self) -> bool {
        matches!(self, Mode::MultiPort | Mode::Hybrid)
    }

    /// The aggregated pool listener exists in pool and hybrid modes.
    pub fn has_pool_listener(self) -> bool {
        matches!(self, Mode::Pool | Mode::Hybrid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Pool => "pool",
            Mode::MultiPort => "multi-port",
            Mode::Hybrid => "hybrid",
        }
    }
}

/// Top-level settings for the proxy pool server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub multi_port: MultiPortConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub management: ManagementConfig,
    #[serde(default)]
    pub subscription_refresh: SubscriptionRefreshConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub virtual_pools: Vec<VirtualPoolConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeConfig>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nodes_file: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscriptions: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub external_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_level: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub singbox_log_level: String,
    #[serde(default)]
    pub skip_cert_verify: bool,

    /// Where the config was loaded from; used by persistence.
    #[serde(skip)]
    pub(crate) file_path: PathBuf,
}

/// The aggregated HTTP proxy listener (pool / hybrid modes).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".into(),
            port: 2323,
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Address/credential defaults for the per-node listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiPortConfig {
    pub address: String,
    pub base_port: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
}

impl Default for MultiPortConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".into(),
            base_port: 28000,
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Scheduling and failure handling for the pool frontend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub mode: String,
    pub failure_threshold: u32,
    #[serde(with = "duration_serde")]
    pub blacklist_duration: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            mode: "sequential".into(),
            failure_threshold: 3,
            blacklist_duration: Duration::from_secs(24 * 3600),
        }
    }
}

/// Management HTTP endpoint and node probing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    pub listen: String,
    pub probe_target: String,
    #[serde(with = "duration_serde")]
    pub probe_interval: Duration,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path_pwd: String,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            listen: "127.0.0.1:9090".into(),
            probe_target: "www.apple.com:80".into(),
            probe_interval: Duration::from_secs(60),
            password: String::new(),
            path_pwd: String::new(),
        }
    }
}

/// Subscription auto-refresh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionRefreshConfig {
    pub enabled: bool,
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    #[serde(with = "duration_serde")]
    pub health_check_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub drain_timeout: Duration,
    pub min_available_nodes: usize,
}

impl Default for SubscriptionRefreshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(3600),
            timeout: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
            min_available_nodes: 1,
        }
    }
}

/// A regex-filtered slice of nodes exposed on its own port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualPoolConfig {
    pub name: String,
    /// Regex matched against node names.
    pub regular: String,
    #[serde(default = "default_vpool_address")]
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default = "default_vpool_strategy")]
    pub strategy: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub max_latency_ms: u64,
}

fn default_vpool_address() -> String {
    "0.0.0.0".into()
}

fn default_vpool_strategy() -> String {
    "sequential".into()
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

impl Config {
    /// Read YAML from disk, resolve the nodes-file path and mark inline nodes.
    ///
    /// Node-set normalisation is a separate step ([`Config::normalize`]) so
    /// that subscription contents can be merged in between.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg: Config = serde_yaml::from_str(&text)?;
        cfg.file_path = path.to_path_buf();

        // nodes_file is relative to the config file directory
        if !cfg.nodes_file.is_empty() && !Path::new(&cfg.nodes_file).is_absolute() {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            cfg.nodes_file = dir.join(&cfg.nodes_file).to_string_lossy().into_owned();
        }

        for node in &mut cfg.nodes {
            node.source = NodeSource::Inline;
        }
        Ok(cfg)
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn set_file_path<P: Into<PathBuf>>(&mut self, path: P) {
        self.file_path = path.into();
    }

    pub fn management_enabled(&self) -> bool {
        self.management.enabled.unwrap_or(true)
    }

    /// Path of the external nodes file, defaulting to `nodes.txt` next to
    /// the config file.
    pub fn nodes_file_path(&self) -> PathBuf {
        if !self.nodes_file.is_empty() {
            return PathBuf::from(&self.nodes_file);
        }
        let dir = self.file_path.parent().unwrap_or_else(|| Path::new("."));
        dir.join("nodes.txt")
    }

    /// Append file-sourced nodes when a nodes file is configured and no
    /// subscription takes priority over it.
    pub fn merge_file_nodes(&mut self) -> Result<(), ConfigError> {
        if self.nodes_file.is_empty() || !self.subscriptions.is_empty() {
            return Ok(());
        }
        let path = PathBuf::from(&self.nodes_file);
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::NodesFile {
            path: path.clone(),
            source,
        })?;
        let mut parsed = nodes::parse_nodes_content(&text);
        for node in &mut parsed {
            node.source = NodeSource::File;
        }
        self.nodes.extend(parsed);
        Ok(())
    }

    /// Append subscription-sourced nodes and persist them to the nodes file
    /// (subscriptions overwrite it, they are the highest-priority source).
    pub fn merge_subscription_nodes(&mut self, mut fetched: Vec<NodeConfig>) {
        if fetched.is_empty() {
            return;
        }
        for node in &mut fetched {
            node.source = NodeSource::Subscription;
        }
        let path = self.nodes_file_path();
        if self.nodes_file.is_empty() {
            self.nodes_file = path.to_string_lossy().into_owned();
        }
        if let Err(e) = nodes::write_nodes_file(&path, &fetched) {
            tracing::warn!(path = %path.display(), error = %e, "failed to write subscription nodes");
        } else {
            tracing::info!(count = fetched.len(), path = %path.display(), "written subscription nodes");
        }
        self.nodes.extend(fetched);
    }

    /// URI → port map of the current node set, used to keep assignments
    /// stable across reloads.
    pub fn build_port_map(&self) -> HashMap<String, u16> {
        self.nodes
            .iter()
            .filter(|n| n.port > 0)
            .map(|n| (n.node_key().to_string(), n.port))
            .collect()
    }

    /// Subscription entries support a `name:URL` prefix; the name tags the
    /// nodes that came from that subscription.
    pub fn parse_subscription_entry(entry: &str) -> (Option<&str>, &str) {
        let entry = entry.trim();
        if entry.starts_with("http://") || entry.starts_with("https://") {
            return (None, entry);
        }
        match entry.split_once(':') {
            Some((name, rest)) if !rest.starts_with("//") => (Some(name.trim()), rest.trim()),
            _ => (None, entry),
        }
    }
}

/// True when the port can be bound on the given address right now.
pub fn port_available(address: &str, port: u16) -> bool {
    TcpListener::bind((address, port)).is_ok()
}

/// Durations are written the way humans write them ("24h", "30s", "500ms").
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
