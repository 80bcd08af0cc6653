//! Runtime configuration loaded from `config.toml`.
//!
//! The config names the factory deployment to index — its address and
//! deployment block — plus the RPC endpoints to read the chain through,
//! in fallback order. CLI flags override individual fields.

use std::path::{Path, PathBuf};

use alloy::primitives::Address;
use anyhow::{Context, Result, ensure};
use serde::Deserialize;

const fn default_confirmations() -> u64 {
    2
}

const fn default_poll_interval() -> u64 {
    12
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Indexer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The factory contract whose deployments are indexed.
    pub factory: Address,

    /// Block the factory was deployed at; fresh syncs start here.
    #[serde(default)]
    pub deployment_block: u64,

    /// RPC endpoints, best first. The sync falls back down the list.
    #[serde(default)]
    pub rpcs: Vec<String>,

    /// Blocks behind the head considered final enough to index.
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,

    /// Seconds between polls in watch mode.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Directory holding the state snapshot and sync cursor.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file is absent, unreadable, or does not
    /// parse — the factory address has no sensible default, so a config
    /// file is required.
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check operational requirements not expressible in the schema.
    ///
    /// # Errors
    ///
    /// Returns an error when no RPC endpoint is configured.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.rpcs.is_empty(),
            "no RPC endpoint configured; set `rpcs` in the config or pass --rpc"
        );
        Ok(())
    }

    /// Path of the derived-state snapshot.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }
}
