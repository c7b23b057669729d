//! Checksum-driven update of an existing projection.
//!
//! Three phases run in fixed order: additions, deletions and changes. Each phase lists its record
//! ids into a temporary table on the reader session, walks them with a cursor and applies the
//! corresponding row and checksum updates in a single writer transaction. A failed phase rolls
//! back completely and aborts the run.

use std::fmt;

use marct_config::shared::{PgConnectionConfig, SyncConfig};
use tokio_postgres::Statement;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checksum;
use crate::client::{ConnectionRole, PgClient, projection_params};
use crate::error::{ErrorKind, MarctError, MarctResult};
use crate::identity::encode_identifier;
use crate::marct_error;
use crate::partition::PartitionManager;
use crate::schema::{ProjectionTables, SourceFilter, insert_row_sql};
use crate::sync::finish_tx;
use crate::sync::scan::SourceScan;
use crate::transform::project_record;
use crate::types::SourceRecord;

/// The phases of an incremental run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Additions,
    Deletions,
    Changes,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Additions, Phase::Deletions, Phase::Changes];

    fn id_table(self) -> &'static str {
        match self {
            Phase::Additions => "marct_added_ids",
            Phase::Deletions => "marct_deleted_ids",
            Phase::Changes => "marct_changed_ids",
        }
    }

    fn cursor(self) -> &'static str {
        match self {
            Phase::Additions => "marct_added_scan",
            Phase::Deletions => "marct_deleted_scan",
            Phase::Changes => "marct_changed_scan",
        }
    }

    fn id_query(self, tables: &ProjectionTables) -> String {
        match self {
            Phase::Additions => tables.added_ids_sql(),
            Phase::Deletions => tables.deleted_ids_sql(),
            Phase::Changes => tables.changed_ids_sql(),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Additions => write!(f, "additions"),
            Phase::Deletions => write!(f, "deletions"),
            Phase::Changes => write!(f, "changes"),
        }
    }
}

/// Counters of an incremental run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementalSummary {
    /// New records that were projected.
    pub added: u64,
    /// Records removed because their source record is gone.
    pub deleted: u64,
    /// Changed records that were projected again.
    pub changed: u64,
    /// Changed records that are no longer current and were only removed.
    pub retired: u64,
    /// Records rejected by the transformer.
    pub records_skipped: u64,
    /// Rows inserted into the projection.
    pub rows_written: u64,
    /// Rows dropped because their field is not a known category.
    pub rows_skipped: u64,
}

/// Sessions and per-run state shared by the phases.
struct PhaseContext<'a> {
    reader: &'a PgClient,
    writer: &'a PgClient,
    probe: Option<&'a PgClient>,
    partitions: &'a mut PartitionManager,
    summary: &'a mut IncrementalSummary,
}

/// Applies source changes since the last snapshot to the production projection.
#[derive(Debug)]
pub struct IncrementalSynchronizer<'a> {
    connection: &'a PgConnectionConfig,
    tables: &'a ProjectionTables,
    config: &'a SyncConfig,
}

impl<'a> IncrementalSynchronizer<'a> {
    pub fn new(
        connection: &'a PgConnectionConfig,
        tables: &'a ProjectionTables,
        config: &'a SyncConfig,
    ) -> IncrementalSynchronizer<'a> {
        IncrementalSynchronizer {
            connection,
            tables,
            config,
        }
    }

    /// Runs all phases. The checksum snapshot must exist and match the schema version.
    pub async fn run(&self) -> MarctResult<IncrementalSummary> {
        info!(target_table = %self.tables.target, "starting incremental update");

        let reader = PgClient::connect(self.connection, ConnectionRole::Reader).await?;
        let writer = PgClient::connect(self.connection, ConnectionRole::Writer).await?;
        let mut partitions = PartitionManager::new(self.tables.target.clone());
        let mut summary = IncrementalSummary::default();

        for phase in Phase::ALL {
            // The probe only serves the diagnostics of the change phase.
            let probe = match phase {
                Phase::Changes => {
                    Some(PgClient::connect(self.connection, ConnectionRole::Probe).await?)
                }
                _ => None,
            };

            let mut context = PhaseContext {
                reader: &reader,
                writer: &writer,
                probe: probe.as_ref(),
                partitions: &mut partitions,
                summary: &mut summary,
            };

            self.run_phase(phase, &mut context).await.map_err(|err| {
                marct_error!(
                    err.kind(),
                    "Incremental phase failed",
                    format!("phase '{phase}'"),
                    source: err
                )
            })?;
        }

        info!(
            added = summary.added,
            deleted = summary.deleted,
            changed = summary.changed,
            retired = summary.retired,
            records_skipped = summary.records_skipped,
            "completed incremental update"
        );

        Ok(summary)
    }

    async fn run_phase(&self, phase: Phase, context: &mut PhaseContext<'_>) -> MarctResult<()> {
        let reader = context.reader;

        reader.begin_snapshot_tx().await?;
        let result = self.apply_phase(phase, context).await;
        finish_tx(reader, result).await
    }

    /// Lists the ids of `phase` and applies them in one writer transaction.
    ///
    /// Runs inside the reader transaction; the temporary id table is dropped when it ends.
    async fn apply_phase(&self, phase: Phase, context: &mut PhaseContext<'_>) -> MarctResult<()> {
        let reader = context.reader;
        let writer = context.writer;
        let ids = phase.id_table();

        reader
            .batch_execute(&format!(
                "create temporary table {ids} (id uuid primary key) on commit drop"
            ))
            .await?;
        let listed = reader
            .execute(
                &format!("insert into {ids} (id) {}", phase.id_query(self.tables)),
                &[],
            )
            .await?;

        info!(%phase, records = listed, "listed records for phase");
        if listed == 0 {
            return Ok(());
        }

        writer.begin_tx().await?;
        let result = match phase {
            Phase::Deletions => self.delete_listed(phase, context).await,
            Phase::Additions | Phase::Changes => self.project_listed(phase, context).await,
        };
        finish_tx(writer, result).await
    }

    async fn delete_listed(&self, phase: Phase, context: &mut PhaseContext<'_>) -> MarctResult<()> {
        let delete_rows = self.delete_rows_statement(context.writer).await?;
        let mut scan = SourceScan::open(
            context.reader,
            phase.cursor(),
            &format!("select id from {}", phase.id_table()),
            self.config.cursor_fetch_size,
        )
        .await?;

        while let Some(row) = scan.next_row().await? {
            let id: Uuid = row.try_get(0)?;

            let rows = context.writer.execute(&delete_rows, &[&id]).await?;
            checksum::delete_entry(context.writer, self.tables, id).await?;

            debug!(record_id = %id, rows, "deleted record");
            context.summary.deleted += 1;
        }

        scan.close().await
    }

    async fn project_listed(&self, phase: Phase, context: &mut PhaseContext<'_>) -> MarctResult<()> {
        let delete_rows = self.delete_rows_statement(context.writer).await?;
        let insert_row = context
            .writer
            .prepare(&insert_row_sql(&self.tables.target))
            .await?;
        // Partition creation holds an exclusive lock on the projection until the writer commits,
        // so the probe session only reads the checksum relation.
        let exists = match context.probe {
            Some(probe) => Some(
                probe
                    .prepare(&format!(
                        "select exists (select 1 from {} where id = $1)",
                        self.tables.checksum.as_quoted_identifier()
                    ))
                    .await?,
            ),
            None => None,
        };

        let mut scan = SourceScan::open(
            context.reader,
            phase.cursor(),
            &self.tables.source_query(SourceFilter::IdsIn(phase.id_table())),
            self.config.cursor_fetch_size,
        )
        .await?;

        while let Some(record) = scan.next_record().await? {
            if phase == Phase::Changes {
                let id = encode_identifier(&record.id, &record.id);
                self.log_existing(context.probe, exists.as_ref(), id).await?;

                context.writer.execute(&delete_rows, &[&id]).await?;
                checksum::delete_entry(context.writer, self.tables, id).await?;
            }

            let written = self.insert_record(&record, &insert_row, context).await?;
            match (phase, written) {
                (Phase::Additions, true) => context.summary.added += 1,
                (Phase::Changes, true) => context.summary.changed += 1,
                (Phase::Changes, false) => context.summary.retired += 1,
                _ => {}
            }
        }

        scan.close().await
    }

    /// Logs whether the committed snapshot already tracks `id`, as seen by the probe session.
    async fn log_existing(
        &self,
        probe: Option<&PgClient>,
        statement: Option<&Statement>,
        id: Uuid,
    ) -> MarctResult<()> {
        let (Some(probe), Some(statement)) = (probe, statement) else {
            return Ok(());
        };

        let present: bool = probe.query_one(statement, &[&id]).await?.try_get(0)?;
        if present {
            debug!(record_id = %id, "replacing projected rows of changed record");
        } else {
            debug!(record_id = %id, "changed record has no projected rows yet");
        }

        Ok(())
    }

    /// Projects `record` and inserts its rows and checksum entry.
    ///
    /// Returns whether any row was written. Records without rows get no checksum entry.
    async fn insert_record(
        &self,
        record: &SourceRecord,
        insert_row: &Statement,
        context: &mut PhaseContext<'_>,
    ) -> MarctResult<bool> {
        let projection = match project_record(record) {
            Ok(projection) => projection,
            Err(err) => {
                warn!(record_id = %record.id, error = %err, "skipping record that could not be parsed");
                context.summary.records_skipped += 1;
                return Ok(false);
            }
        };

        let mut written = 0;
        for row in &projection.rows {
            let Some(category) = row.category() else {
                warn!(record_id = %record.id, field = %row.field, line = row.line, "skipping row with unknown field");
                context.summary.rows_skipped += 1;
                continue;
            };

            context
                .partitions
                .ensure(context.writer, category, &row.sf)
                .await?;
            context
                .writer
                .execute(insert_row, &projection_params(row))
                .await?;
            written += 1;
        }

        let Some(first) = projection.rows.first().filter(|_| written > 0) else {
            return Ok(false);
        };

        checksum::insert_entry(context.writer, self.tables, first.srs_id, &record.digest).await?;
        context.summary.rows_written += written;

        Ok(true)
    }

    async fn delete_rows_statement(&self, writer: &PgClient) -> MarctResult<Statement> {
        writer
            .prepare(&format!(
                "delete from {} where srs_id = $1",
                self.tables.target.as_quoted_identifier()
            ))
            .await
    }
}

/// Fails with [`ErrorKind::IncrementalTimeout`] naming the configured deadline.
pub(crate) fn deadline_exceeded(config: &SyncConfig) -> MarctError {
    marct_error!(
        ErrorKind::IncrementalTimeout,
        "Incremental update exceeded its deadline",
        format!("deadline of {}s", config.incremental_deadline_secs)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use marct_config::shared::{DeploymentProfile, TableLayout};

    #[test]
    fn phases_run_in_fixed_order() {
        assert_eq!(
            Phase::ALL,
            [Phase::Additions, Phase::Deletions, Phase::Changes]
        );
        assert_eq!(Phase::Changes.to_string(), "changes");
    }

    #[test]
    fn phase_queries_select_single_id_column() {
        let tables = ProjectionTables::new(&TableLayout::for_profile(DeploymentProfile::Metadb));

        for phase in Phase::ALL {
            let sql = phase.id_query(&tables);
            assert!(sql.starts_with("select "), "{phase}: {sql}");
            assert!(sql.contains("marc__t__cksum"), "{phase}: {sql}");
        }

        assert!(Phase::Changes.id_query(&tables).contains("k.cksum <> md5("));
    }
}
