use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use pop_replication::DispatchOptions;
use pop_retrieval::Ask;
use pop_types::Region;

/// Dispatch tuning, expressed in plain units so it can live in a config
/// file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_factor: u32,
    pub max_attempts: u32,
    pub replication_factor: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            backoff_min_ms: 2_000,
            backoff_max_ms: 60 * 60 * 1_000,
            backoff_factor: 2,
            max_attempts: 4,
            replication_factor: 7,
        }
    }
}

impl From<DispatchConfig> for DispatchOptions {
    fn from(c: DispatchConfig) -> Self {
        DispatchOptions {
            backoff_min: Duration::from_millis(c.backoff_min_ms),
            backoff_max: Duration::from_millis(c.backoff_max_ms),
            backoff_factor: c.backoff_factor,
            max_attempts: c.max_attempts,
            rf: c.replication_factor,
        }
    }
}

/// Configuration for an exchange instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Region names this node participates in.
    pub regions: Vec<String>,
    /// Storage capacity in bytes dedicated to the exchange. Zero disables
    /// eviction.
    pub capacity: u64,
    /// Terms we serve retrievals under.
    #[serde(default)]
    pub ask: Ask,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Version announced in the hey handshake; peers on another version are
    /// demoted.
    #[serde(default = "default_hey_version")]
    pub hey_version: String,
    /// How long gossip discovery collects offers.
    #[serde(default = "default_gossip_timeout_ms")]
    pub gossip_timeout_ms: u64,
}

fn default_hey_version() -> String {
    pop_peers::HEY_VERSION.to_string()
}

fn default_gossip_timeout_ms() -> u64 {
    5_000
}

impl Default for Options {
    fn default() -> Self {
        Self {
            regions: vec!["Global".to_string()],
            capacity: 0,
            ask: Ask::default(),
            dispatch: DispatchConfig::default(),
            hey_version: default_hey_version(),
            gossip_timeout_ms: default_gossip_timeout_ms(),
        }
    }
}

impl Options {
    pub fn from_json(data: &str) -> anyhow::Result<Self> {
        serde_json::from_str(data).context("parsing exchange options")
    }

    /// Resolve the configured region names, dropping unknown spellings.
    pub fn parsed_regions(&self) -> Vec<Region> {
        Region::parse_names(&self.regions)
    }

    pub fn gossip_timeout(&self) -> Duration {
        Duration::from_millis(self.gossip_timeout_ms)
    }
}
