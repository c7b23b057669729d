use anyhow::Context;
use marct_config::load_config;
use marct_config::shared::SyncerConfig;

/// Loads and validates the syncer configuration.
pub fn load_syncer_config() -> anyhow::Result<SyncerConfig> {
    let config = load_config::<SyncerConfig>().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    Ok(config)
}
