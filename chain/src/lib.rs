pub mod config;

pub use config::{ChainSpec, ConfigError, NodeConfig, SpecProvider, SyncConfig};
