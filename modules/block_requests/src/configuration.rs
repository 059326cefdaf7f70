use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use config::Config;

use crate::block_sync::SyncSettings;
use crate::fetch_worker::FetchSettings;

/// Where block records are persisted
#[derive(Clone, Copy, Debug, Default, serde::Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    #[default]
    Memory,
    Fjall,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockRequestsConfig {
    pub command_topic: String,
    pub header_topic: String,
    pub events_topic: String,
    pub peer_network_topic: String,
    pub validation_topic: String,
    pub auto_request_blocks: bool,
    pub max_in_flight: usize,
    pub request_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub max_attempts: u32,
    #[serde(default)]
    pub store: StoreKind,
    pub database_path: PathBuf,
    #[serde(default)]
    pub clear_on_start: bool,
    /// Serialized genesis block, hex
    pub genesis_block: String,
}

impl BlockRequestsConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            auto_request: self.auto_request_blocks,
            max_attempts: self.max_attempts.max(1),
            fetch: FetchSettings {
                max_in_flight: self.max_in_flight.max(1),
                request_timeout: Duration::from_millis(self.request_timeout_ms),
                retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            },
        }
    }
}
