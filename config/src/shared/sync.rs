use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::shared::ValidationError;

/// Settings controlling how the projection is synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Always perform a full rebuild, even when a compatible checksum snapshot exists.
    #[serde(default)]
    pub force_full: bool,
    /// Build a trigram index on the content column when `pg_trgm` is available.
    #[serde(default)]
    pub trigram_index: bool,
    /// Accounts granted read access to the projection after a full rebuild.
    #[serde(default)]
    pub consumer_accounts: Vec<String>,
    /// When set, rows are written to this file as delimited text instead of being loaded.
    #[serde(default)]
    pub output_file: Option<PathBuf>,
    /// Directory under which the staging store creates its working directory.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Run-wide deadline of the incremental path, in seconds.
    #[serde(default = "default_incremental_deadline_secs")]
    pub incremental_deadline_secs: u64,
    /// Number of source rows fetched per round trip from the read cursor.
    #[serde(default = "default_cursor_fetch_size")]
    pub cursor_fetch_size: u32,
}

impl SyncConfig {
    pub const DEFAULT_INCREMENTAL_DEADLINE_SECS: u64 = 3600;
    pub const DEFAULT_CURSOR_FETCH_SIZE: u32 = 10_000;

    /// Returns the incremental deadline as a [`Duration`].
    pub fn incremental_deadline(&self) -> Duration {
        Duration::from_secs(self.incremental_deadline_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.incremental_deadline_secs == 0 {
            return Err(ValidationError::IncrementalDeadlineZero);
        }

        if self.cursor_fetch_size == 0 {
            return Err(ValidationError::CursorFetchSizeZero);
        }

        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            force_full: false,
            trigram_index: false,
            consumer_accounts: vec![],
            output_file: None,
            staging_dir: default_staging_dir(),
            incremental_deadline_secs: default_incremental_deadline_secs(),
            cursor_fetch_size: default_cursor_fetch_size(),
        }
    }
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir()
}

const fn default_incremental_deadline_secs() -> u64 {
    SyncConfig::DEFAULT_INCREMENTAL_DEADLINE_SECS
}

const fn default_cursor_fetch_size() -> u32 {
    SyncConfig::DEFAULT_CURSOR_FETCH_SIZE
}
