//! Configuration system for Uplink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $UPLINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/uplink/config.toml
//!   3. ~/.config/uplink/config.toml

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::names::NodeName;
use crate::wire::{NodeId, HEADER_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
    /// Nodes this daemon exchanges files with.
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Our node id, stamped into every outbound packet.
    pub node_id: NodeId,
    pub node_name: NodeName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP address the daemon listens on.
    pub bind: SocketAddr,
}

/// Which metadata packet the sender answers ReqMeta with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaForm {
    /// MetaShort: numeric node id, 32-bit size.
    #[default]
    Short,
    /// MetaLong: node name, 64-bit size.
    Long,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Root of the per-peer outgoing/incoming/temp tree.
    pub root: PathBuf,
    /// Largest packet put on the link, header included.
    pub packet_size: usize,
    /// Minimum gap between two requests for the same transaction.
    pub request_timeout_ms: u64,
    /// Unanswered requests before a transaction is declared stalled.
    pub max_retries: u32,
    /// Data packets sent per transaction per sweep.
    pub burst_chunks: usize,
    /// Sweep period.
    pub poll_interval_ms: u64,
    /// Minimum gap between two checkpoints of one transaction.
    pub checkpoint_interval_ms: u64,
    /// How long finished transaction ids are remembered.
    pub tombstone_ttl_secs: u64,
    pub meta_form: MetaForm,
    /// Delete a source file once the peer confirms it.
    pub remove_sent_files: bool,
    /// Active transactions allowed per peer and direction.
    pub queue_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub name: NodeName,
    pub addr: SocketAddr,
}

impl TransferConfig {
    /// Largest chunk a Data packet can carry at the configured packet size.
    pub fn chunk_size(&self) -> usize {
        // node_id + tx_id + byte_count + chunk_start
        const DATA_FIELDS: usize = 1 + 2 + 4 + 4;
        self.packet_size
            .saturating_sub(HEADER_SIZE + DATA_FIELDS)
            .max(1)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_secs(self.tombstone_ttl_secs)
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            node_name: NodeName::new("uplink").unwrap_or_default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 10_020)),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("nodes"),
            packet_size: 217,
            request_timeout_ms: 2_000,
            max_retries: 10,
            burst_chunks: 16,
            poll_interval_ms: 200,
            checkpoint_interval_ms: 5_000,
            tombstone_ttl_secs: 600,
            meta_form: MetaForm::Short,
            remove_sent_files: true,
            queue_limit: 256,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("uplink")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("uplink")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("peer name {0:?} cannot be used as a directory name")]
    UnsafePeerName(String),
    #[error("peer {0} is listed more than once")]
    DuplicatePeer(NodeId),
    #[error("packet_size {0} leaves no room for data")]
    PacketTooSmall(usize),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl UplinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Read one config file, falling back to defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(UplinkConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("UPLINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&UplinkConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Peer entry for `node_id`, if configured.
    pub fn peer(&self, node_id: NodeId) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.node_id == node_id)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let min = crate::wire::PacketKind::Data.min_len() + 1;
        if self.transfer.packet_size < min {
            return Err(ConfigError::PacketTooSmall(self.transfer.packet_size));
        }
        for (i, peer) in self.peers.iter().enumerate() {
            if self.peers[..i].iter().any(|p| p.node_id == peer.node_id) {
                return Err(ConfigError::DuplicatePeer(peer.node_id));
            }
            if !crate::names::is_path_component(peer.name.as_str()) {
                return Err(ConfigError::UnsafePeerName(peer.name.to_string()));
            }
        }
        Ok(())
    }

    /// Apply UPLINK_* env var overrides.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        const NODE_ID: &str = "UPLINK_IDENTITY__NODE_ID";
        const NODE_NAME: &str = "UPLINK_IDENTITY__NODE_NAME";
        const BIND: &str = "UPLINK_NETWORK__BIND";
        const ROOT: &str = "UPLINK_TRANSFER__ROOT";

        if let Some(v) = lookup(NODE_ID) {
            self.identity.node_id = v.parse().map_err(|_| ConfigError::InvalidEnv {
                var: NODE_ID,
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup(NODE_NAME) {
            self.identity.node_name =
                NodeName::new(v.clone()).map_err(|_| ConfigError::InvalidEnv {
                    var: NODE_NAME,
                    value: v,
                })?;
        }
        if let Some(v) = lookup(BIND) {
            self.network.bind = v.parse().map_err(|_| ConfigError::InvalidEnv {
                var: BIND,
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup(ROOT) {
            self.transfer.root = PathBuf::from(v);
        }
        Ok(())
    }
}
