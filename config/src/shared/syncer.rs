use serde::{Deserialize, Serialize};

use crate::Config;
use crate::shared::{
    LayoutConfig, PgConnectionConfig, PgConnectionConfigWithoutSecrets, SyncConfig,
    ValidationError,
};

/// Complete configuration of the syncer binary.
///
/// This intentionally does not implement [`Serialize`] to avoid leaking secrets.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncerConfig {
    /// Database holding both the source relations and the projection.
    pub database: PgConnectionConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl SyncerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.database.validate()?;
        self.layout.resolve().validate()?;
        self.sync.validate()
    }
}

impl Config for SyncerConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["sync.consumer_accounts"];
}

/// Same as [`SyncerConfig`] but without secrets, safe to log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncerConfigWithoutSecrets {
    pub database: PgConnectionConfigWithoutSecrets,
    pub layout: LayoutConfig,
    pub sync: SyncConfig,
}

impl From<SyncerConfig> for SyncerConfigWithoutSecrets {
    fn from(value: SyncerConfig) -> Self {
        SyncerConfigWithoutSecrets {
            database: value.database.into(),
            layout: value.layout,
            sync: value.sync,
        }
    }
}
