//! Node configuration.

use crate::Args;
use anyhow::{bail, Context, Result};
use avn_chain::H256;
use avn_mempool::MempoolConfig;
use avn_sync::{Checkpoint, SyncConfig, SyncMode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name.
    pub node_name: String,
    /// Genesis block parameters.
    #[serde(default)]
    pub genesis: GenesisConfig,
    /// Sync configuration.
    #[serde(default)]
    pub sync: SyncSection,
    /// Mempool configuration.
    #[serde(default)]
    pub mempool: MempoolSection,
}

/// Genesis block parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    pub difficulty: u128,
    pub timestamp: u64,
    /// Hex encoded extra data.
    pub extra: String,
    /// Value of the single genesis state entry.
    pub state: String,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            difficulty: 1,
            timestamp: 0,
            extra: String::new(),
            state: "avalanria".to_string(),
        }
    }
}

/// A block number and the hash expected there.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockRef {
    pub number: u64,
    pub hash: H256,
}

/// `[sync]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Sync mode (full, fast).
    pub mode: String,
    /// Trusted checkpoint peers are challenged with.
    pub checkpoint: Option<BlockRef>,
    /// Blocks every peer must agree on.
    pub whitelist: Vec<BlockRef>,
    /// Peers required before syncing starts.
    pub min_peers: usize,
    /// Seconds after which sync starts with fewer peers.
    pub force_sync_secs: u64,
    /// Per-request deadline of the downloader in seconds.
    pub request_timeout_secs: u64,
    /// Deadline of the checkpoint challenge in seconds.
    pub challenge_timeout_secs: u64,
    /// Delay before announced blocks and transactions are fetched, in
    /// milliseconds.
    pub arrive_timeout_ms: u64,
    /// Deadline of fetcher requests in seconds.
    pub fetch_timeout_secs: u64,
    /// Seconds between progress log lines.
    pub progress_interval_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        let defaults = SyncConfig::default();
        Self {
            mode: defaults.mode.to_string(),
            checkpoint: None,
            whitelist: Vec::new(),
            min_peers: defaults.chain_sync.min_peers,
            force_sync_secs: defaults.chain_sync.force_sync_interval.as_secs(),
            request_timeout_secs: defaults.downloader.request_timeout.as_secs(),
            challenge_timeout_secs: defaults.handler.challenge_timeout.as_secs(),
            arrive_timeout_ms: defaults.block_fetcher.arrive_timeout.as_millis() as u64,
            fetch_timeout_secs: defaults.block_fetcher.fetch_timeout.as_secs(),
            progress_interval_secs: 30,
        }
    }
}

/// `[mempool]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolSection {
    /// Maximum number of transactions.
    pub max_transactions: usize,
    /// Maximum size of a single transaction in bytes.
    pub max_tx_size: usize,
}

impl Default for MempoolSection {
    fn default() -> Self {
        let defaults = MempoolConfig::default();
        Self {
            max_transactions: defaults.max_transactions,
            max_tx_size: defaults.max_tx_size,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "avn-node".to_string(),
            genesis: GenesisConfig::default(),
            sync: SyncSection::default(),
            mempool: MempoolSection::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default()
        };

        if let Some(ref mode) = args.mode {
            config.sync.mode = mode.clone();
        }
        if let Some(min_peers) = args.min_peers {
            config.sync.min_peers = min_peers;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.sync_mode()?;
        if self.genesis.difficulty == 0 {
            bail!("genesis difficulty must be positive");
        }
        hex::decode(&self.genesis.extra).context("genesis extra is not valid hex")?;
        let mut seen = std::collections::HashSet::new();
        for entry in &self.sync.whitelist {
            if !seen.insert(entry.number) {
                bail!("whitelist lists block {} twice", entry.number);
            }
        }
        Ok(())
    }

    pub fn sync_mode(&self) -> Result<SyncMode> {
        self.sync.mode.parse().map_err(anyhow::Error::msg)
    }

    /// Library configuration of the sync subsystem.
    pub fn sync_config(&self) -> Result<SyncConfig> {
        let section = &self.sync;
        let mut config = SyncConfig {
            mode: self.sync_mode()?,
            ..Default::default()
        };
        config.chain_sync.min_peers = section.min_peers;
        config.chain_sync.force_sync_interval = Duration::from_secs(section.force_sync_secs);
        config.downloader.request_timeout = Duration::from_secs(section.request_timeout_secs);
        config.handler.challenge_timeout = Duration::from_secs(section.challenge_timeout_secs);
        config.handler.checkpoint = section.checkpoint.map(|cp| Checkpoint {
            number: cp.number,
            hash: cp.hash,
        });
        config.handler.whitelist = section
            .whitelist
            .iter()
            .map(|entry| (entry.number, entry.hash))
            .collect();

        let arrive = Duration::from_millis(section.arrive_timeout_ms);
        let fetch = Duration::from_secs(section.fetch_timeout_secs);
        config.block_fetcher.arrive_timeout = arrive;
        config.block_fetcher.fetch_timeout = fetch;
        config.tx_fetcher.arrive_timeout = arrive;
        config.tx_fetcher.fetch_timeout = fetch;
        Ok(config)
    }

    pub fn mempool_config(&self) -> MempoolConfig {
        MempoolConfig {
            max_transactions: self.mempool.max_transactions,
            max_tx_size: self.mempool.max_tx_size,
        }
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
