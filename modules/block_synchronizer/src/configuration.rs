use anyhow::Result;
use config::Config;
use std::time::Duration;

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SynchronizerConfig {
    /// Outgoing peer requests (identifier samples, block fetches)
    pub request_topic: String,

    /// Incoming peer identifier lists
    pub ids_topic: String,

    /// Incoming raw blocks
    pub blocks_topic: String,

    /// Reassembled batches for the applier
    pub batch_topic: String,

    /// Chain events, for tracking our own recent identifiers
    pub chain_topic: String,

    /// Round cancellation commands
    pub control_topic: String,

    /// Most blocks requested in one round
    pub max_batch_size: usize,

    /// Recent identifiers offered to the peer when locating the common point
    pub id_sample_size: usize,

    pub ids_timeout: u64,
    pub block_timeout: u64,
    pub batch_timeout: u64,
    pub round_delay: u64,
}

impl SynchronizerConfig {
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

    pub fn ids_timeout(&self) -> Duration {
        Duration::from_secs(self.ids_timeout)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_secs(self.block_timeout)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout)
    }

    pub fn round_delay(&self) -> Duration {
        Duration::from_secs(self.round_delay)
    }
}
