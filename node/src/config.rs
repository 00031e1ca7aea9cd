//! # Node Configuration File
//!
//! TOML read at startup. Carries everything two validators must agree on
//! (the genesis) plus the local wiring: listen addresses, peers, HTTP
//! fallback endpoints, and a few timing knobs.
//!
//! ```toml
//! sync_mode = "auto"
//!
//! [network]
//! p2p_listen = "0.0.0.0:9740"
//! api_listen = "0.0.0.0:9741"
//! metrics_listen = "0.0.0.0:9742"
//! peers = ["10.0.0.2:9740", "10.0.0.3:9740"]
//! http_fallback = ["http://10.0.0.2:9741"]
//!
//! [consensus]
//! block_interval_ms = 1000
//! base_timeout_ms = 3000
//!
//! [genesis]
//! accounts = [["alice", 1000000]]
//! validators = [["<hex pubkey>", 10000]]
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use pop_protocol::config::{DEFAULT_METRICS_PORT, DEFAULT_P2P_PORT, DEFAULT_RPC_PORT};
use pop_protocol::network::SyncSetting;
use pop_protocol::storage::Genesis;
use pop_protocol::NodeConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFile {
    #[serde(default = "default_sync_mode")]
    pub sync_mode: SyncSetting,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub consensus: ConsensusSection,
    pub genesis: Genesis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub p2p_listen: SocketAddr,
    pub api_listen: SocketAddr,
    pub metrics_listen: SocketAddr,
    pub peers: Vec<SocketAddr>,
    /// Base URLs of nodes whose `/sync` endpoint serves catch-up in HTTP
    /// mode.
    pub http_fallback: Vec<String>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            p2p_listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_P2P_PORT)),
            api_listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_RPC_PORT)),
            metrics_listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_METRICS_PORT)),
            peers: Vec::new(),
            http_fallback: Vec::new(),
        }
    }
}

/// Optional overrides of the consensus defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSection {
    pub block_interval_ms: Option<u64>,
    pub base_timeout_ms: Option<u64>,
    pub max_proofs_per_block: Option<usize>,
}

fn default_sync_mode() -> SyncSetting {
    SyncSetting::Auto
}

impl NodeFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let file: NodeFile =
            toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))?;
        file.validate()?;
        Ok(file)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).context("failed to encode config")?;
        std::fs::write(path, text).with_context(|| format!("failed to write config {}", path.display()))
    }

    /// A devnet where `validator` is the only validator.
    pub fn single_validator(validator: &str) -> Self {
        Self {
            sync_mode: SyncSetting::Auto,
            network: NetworkSection::default(),
            consensus: ConsensusSection::default(),
            genesis: Genesis {
                accounts: vec![(validator.to_string(), 1_000_000)],
                validators: vec![(validator.to_string(), 10_000)],
                ..Genesis::default()
            },
        }
    }

    fn validate(&self) -> Result<()> {
        if self.genesis.validators.is_empty() {
            bail!("genesis has no validators");
        }
        for (key, stake) in &self.genesis.validators {
            if key.len() != 64 || hex::decode(key).is_err() {
                bail!("genesis validator {key:?} is not a hex ed25519 public key");
            }
            if *stake < self.genesis.stake.min_stake {
                bail!("genesis validator {key} bonds {stake}, below the minimum stake");
            }
        }
        for url in &self.network.http_fallback {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("http fallback {url:?} is not an http(s) URL");
            }
        }
        Ok(())
    }

    pub fn node_config(&self) -> NodeConfig {
        let mut config = NodeConfig {
            sync_setting: self.sync_mode,
            ..NodeConfig::default()
        };
        if let Some(ms) = self.consensus.block_interval_ms {
            config.consensus.block_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.consensus.base_timeout_ms {
            config.consensus.timeouts.base_ms = ms;
        }
        if let Some(max) = self.consensus.max_proofs_per_block {
            config.max_proofs_per_block = max;
        }
        config
    }
}
