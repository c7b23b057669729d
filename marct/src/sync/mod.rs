//! Selection between incremental and full synchronization.
//!
//! A run is incremental when a compatible checksum snapshot exists and a full rebuild was not
//! requested. A failed or timed out incremental run is followed by exactly one full rebuild.

use marct_config::shared::{PgConnectionConfig, SyncConfig, TableLayout};
use tracing::{error, info, warn};

use crate::checksum::{SnapshotStatus, snapshot_status};
use crate::client::{ConnectionRole, PgClient};
use crate::error::{MarctError, MarctResult};
use crate::schema::ProjectionTables;

pub mod full;
pub mod incremental;
mod scan;

pub use full::{FullSyncSummary, FullSynchronizer};
pub use incremental::{IncrementalSummary, IncrementalSynchronizer, Phase};

/// Commits on success and rolls back on failure, returning the original result.
pub(crate) async fn finish_tx<T>(client: &PgClient, result: MarctResult<T>) -> MarctResult<T> {
    match result {
        Ok(value) => {
            client.commit_tx().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = client.rollback_tx().await {
                warn!(role = %client.role(), error = %rollback_err, "failed to roll back transaction");
            }
            Err(err)
        }
    }
}

/// How a run ended up updating the projection.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Incremental(IncrementalSummary),
    Full(FullSyncSummary),
    /// A full rebuild that replaced a failed incremental run.
    FullAfterFallback {
        summary: FullSyncSummary,
        incremental_error: MarctError,
    },
    /// Rows were written to a file instead of the database.
    File(FullSyncSummary),
}

/// Runs one synchronization of a deployment's projection.
#[derive(Debug)]
pub struct Synchronizer {
    connection: PgConnectionConfig,
    tables: ProjectionTables,
    config: SyncConfig,
}

impl Synchronizer {
    pub fn new(connection: PgConnectionConfig, layout: &TableLayout, config: SyncConfig) -> Self {
        Synchronizer {
            connection,
            tables: ProjectionTables::new(layout),
            config,
        }
    }

    pub fn tables(&self) -> &ProjectionTables {
        &self.tables
    }

    fn full(&self) -> FullSynchronizer<'_> {
        FullSynchronizer::new(&self.connection, &self.tables, &self.config)
    }

    /// Whether the incremental path can be used, per the snapshot found in the database.
    pub async fn incremental_available(&self) -> MarctResult<bool> {
        let probe = PgClient::connect(&self.connection, ConnectionRole::Probe).await?;

        match snapshot_status(&probe, &self.tables).await? {
            SnapshotStatus::Compatible => Ok(true),
            SnapshotStatus::Missing => {
                info!("no checksum snapshot found, incremental update unavailable");
                Ok(false)
            }
            SnapshotStatus::VersionMismatch { found } => {
                info!(
                    ?found,
                    expected = crate::checksum::SCHEMA_VERSION,
                    "checksum snapshot version differs, incremental update unavailable"
                );
                Ok(false)
            }
        }
    }

    pub async fn run(&self) -> MarctResult<SyncOutcome> {
        if let Some(path) = &self.config.output_file {
            return self.full().write_file(path).await.map(SyncOutcome::File);
        }

        if self.config.force_full {
            info!("full rebuild requested");
            return self.full().run().await.map(SyncOutcome::Full);
        }

        if !self.incremental_available().await? {
            return self.full().run().await.map(SyncOutcome::Full);
        }

        let incremental = IncrementalSynchronizer::new(&self.connection, &self.tables, &self.config);
        let result = match tokio::time::timeout(self.config.incremental_deadline(), incremental.run()).await {
            Ok(result) => result,
            Err(_) => Err(incremental::deadline_exceeded(&self.config)),
        };

        let incremental_error = match result {
            Ok(summary) => return Ok(SyncOutcome::Incremental(summary)),
            Err(err) => err,
        };

        error!(error = %incremental_error, "incremental update failed, falling back to full rebuild");

        match self.full().run().await {
            Ok(summary) => Ok(SyncOutcome::FullAfterFallback {
                summary,
                incremental_error,
            }),
            Err(full_error) => Err(MarctError::from(vec![incremental_error, full_error])),
        }
    }
}
