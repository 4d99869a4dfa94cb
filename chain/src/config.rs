use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

pub const MAX_HEADERS_PER_REQUEST: usize = 192;
pub const MAX_BODIES_PER_REQUEST: usize = 32;
pub const ALLOCATION_TIMEOUT_MS: u64 = 1_000;
pub const EMPTY_REQUEST_BACKOFF_MS: u64 = 10;
pub const BEST_KNOWN_SEARCH_LIMIT: u64 = 256_000_000;
pub const MAX_CONCURRENT_REQUESTS_PER_PEER: usize = 1;

/// Fork parameters consulted by fork choice.
pub trait SpecProvider: Send + Sync {
    fn terminal_total_difficulty(&self) -> Option<U256>;

    fn is_eip1559_enabled(&self, number: u64) -> bool;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChainSpec {
    pub terminal_total_difficulty: Option<U256>,
    pub london_block: Option<u64>,
}

impl ChainSpec {
    pub fn with_terminal_total_difficulty(terminal_total_difficulty: U256) -> Self {
        Self {
            terminal_total_difficulty: Some(terminal_total_difficulty),
            london_block: Some(0),
        }
    }
}

impl SpecProvider for ChainSpec {
    fn terminal_total_difficulty(&self) -> Option<U256> {
        self.terminal_total_difficulty
    }

    fn is_eip1559_enabled(&self, number: u64) -> bool {
        self.london_block.is_some_and(|london| number >= london)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub max_headers_per_request: usize,
    pub max_bodies_per_request: usize,
    /// Bounded wait for a peer allocation before proceeding without a peer.
    pub allocation_timeout_ms: u64,
    /// Pause before re-polling a feed that had no request ready.
    pub empty_request_backoff_ms: u64,
    /// Upper bound of the level search above the head on restart.
    pub best_known_search_limit: u64,
    pub max_concurrent_requests_per_peer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_headers_per_request: MAX_HEADERS_PER_REQUEST,
            max_bodies_per_request: MAX_BODIES_PER_REQUEST,
            allocation_timeout_ms: ALLOCATION_TIMEOUT_MS,
            empty_request_backoff_ms: EMPTY_REQUEST_BACKOFF_MS,
            best_known_search_limit: BEST_KNOWN_SEARCH_LIMIT,
            max_concurrent_requests_per_peer: MAX_CONCURRENT_REQUESTS_PER_PEER,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub chain: ChainSpec,
    pub sync: SyncConfig,
}

impl NodeConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config = serde_yaml::from_reader(reader)?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}
