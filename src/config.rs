//! Gridion Daemon Configuration
//!
//! Local TOML configuration of a gridion process: node identity, the
//! cluster server, the data-api side, the process controller and
//! logging. This is the daemon's own configuration; the grid-wide
//! configuration lives in the versioned config directory.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::model::NodeKind;

/// Main gridion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridionConfig {
    /// Node identity
    pub node: NodeIdentity,

    /// Cluster server configuration
    #[serde(default)]
    pub cluster_server: ClusterServerConfig,

    /// Data-api configuration
    #[serde(default)]
    pub api: ApiNodeConfig,

    /// Process controller configuration
    #[serde(default)]
    pub pcntrl: PcntrlConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// TLS for management connections
    #[serde(default)]
    pub tls: TlsConfig,
}

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Grid this node belongs to
    pub grid: String,

    /// Name of this node within the grid
    pub name: String,

    /// Data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Cluster server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterServerConfig {
    /// Node id of the cluster server in every cluster it serves
    #[serde(default = "default_cs_node_id")]
    pub node_id: u32,

    /// Bind address for the management protocol
    #[serde(default = "default_cs_address")]
    pub bind_address: String,

    /// Directory holding the versioned grid configuration files;
    /// defaults to `<data_dir>/config`
    #[serde(default)]
    pub config_dir: Option<PathBuf>,
}

/// Data-api node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiNodeConfig {
    /// Cluster server addresses to fetch the configuration from
    #[serde(default)]
    pub cluster_servers: Vec<String>,

    /// Node type to request: client, sql server, replication server,
    /// file server, restore or cluster manager
    #[serde(default = "default_node_type")]
    pub node_type: String,

    /// Number of receive tasks
    #[serde(default = "default_receive_threads")]
    pub receive_threads: usize,

    /// Size of the user thread table
    #[serde(default = "default_user_threads")]
    pub user_threads: usize,
}

/// Process controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcntrlConfig {
    /// Bind address of the process controller
    #[serde(default = "default_pcntrl_address")]
    pub bind_address: String,

    /// Installation base; binaries live in `<base>/<version>/bin`
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// TLS configuration for management connections
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    /// Enable TLS wrapping of management connections
    #[serde(default)]
    pub enabled: bool,

    /// Path to certificate file (PEM format)
    #[serde(default)]
    pub cert: Option<PathBuf>,

    /// Path to private key file (PEM format)
    #[serde(default)]
    pub key: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/gridion")
}

fn default_cs_node_id() -> u32 {
    1
}

fn default_cs_address() -> String {
    "0.0.0.0:1186".to_string()
}

fn default_node_type() -> String {
    "client".to_string()
}

fn default_receive_threads() -> usize {
    1
}

fn default_user_threads() -> usize {
    16
}

fn default_pcntrl_address() -> String {
    format!("127.0.0.1:{}", crate::pcntrl::DEF_PCNTRL_PORT)
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/usr/local/gridion")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterServerConfig {
    fn default() -> Self {
        Self {
            node_id: default_cs_node_id(),
            bind_address: default_cs_address(),
            config_dir: None,
        }
    }
}

impl Default for ApiNodeConfig {
    fn default() -> Self {
        Self {
            cluster_servers: Vec::new(),
            node_type: default_node_type(),
            receive_threads: default_receive_threads(),
            user_threads: default_user_threads(),
        }
    }
}

impl Default for PcntrlConfig {
    fn default() -> Self {
        Self {
            bind_address: default_pcntrl_address(),
            base_dir: default_base_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl GridionConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: GridionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.grid.is_empty() {
            return Err(crate::Error::Config("node.grid cannot be empty".into()));
        }
        if self.node.name.is_empty() {
            return Err(crate::Error::Config("node.name cannot be empty".into()));
        }
        if self.api_node_kind().is_none() {
            return Err(crate::Error::Config(format!(
                "unknown api.node_type '{}'",
                self.api.node_type
            )));
        }
        if self.tls.enabled && (self.tls.cert.is_none() || self.tls.key.is_none()) {
            return Err(crate::Error::Config(
                "tls.enabled requires tls.cert and tls.key".into(),
            ));
        }
        Ok(())
    }

    /// The config directory of the cluster server
    pub fn config_dir(&self) -> PathBuf {
        self.cluster_server
            .config_dir
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("config"))
    }

    /// Requested node kind of the data-api side
    pub fn api_node_kind(&self) -> Option<NodeKind> {
        Some(match self.api.node_type.as_str() {
            "client" => NodeKind::Client,
            "sql server" => NodeKind::SqlServer,
            "replication server" => NodeKind::RepServer,
            "file server" => NodeKind::FileServer,
            "restore" => NodeKind::Restore,
            "cluster manager" => NodeKind::ClusterMgr,
            _ => return None,
        })
    }
}
