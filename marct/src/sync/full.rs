//! Complete rebuild of the projection.
//!
//! The new projection is built in a working table next to the production one and only swapped
//! in once it is fully loaded and indexed, so readers see either the old or the new table.

use std::path::Path;

use marct_config::shared::{PgConnectionConfig, SyncConfig};
use marct_postgres::version::{POSTGRES_14, meets_version};
use pg_escape::quote_identifier;
use tracing::{debug, info, warn};

use crate::checksum;
use crate::client::{ConnectionRole, PgClient};
use crate::error::MarctResult;
use crate::file_sink::FileSink;
use crate::partition::{PartitionManager, field_partition_name};
use crate::schema::{
    ProjectionTables, SourceFilter, create_index_statements, create_projection_table_sql,
    create_trigram_index_sql, drop_table_sql,
};
use crate::staging::{StagingStore, WriteOutcome};
use crate::sync::finish_tx;
use crate::sync::scan::SourceScan;
use crate::transform::project_record;

const FULL_CURSOR: &str = "marct_full_scan";

/// Counters of a full rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullSyncSummary {
    /// Current source records read from the cursor.
    pub records_read: u64,
    /// Records rejected by the transformer.
    pub records_skipped: u64,
    /// Rows written to the staging store or the output file.
    pub rows_produced: u64,
    /// Rows dropped because their field is not a known category.
    pub rows_skipped: u64,
    /// Rows copied into the working table.
    pub rows_loaded: u64,
    /// Entries in the new checksum snapshot.
    pub checksum_entries: u64,
}

/// Rebuilds the projection from scratch.
#[derive(Debug)]
pub struct FullSynchronizer<'a> {
    connection: &'a PgConnectionConfig,
    tables: &'a ProjectionTables,
    config: &'a SyncConfig,
}

impl<'a> FullSynchronizer<'a> {
    pub fn new(
        connection: &'a PgConnectionConfig,
        tables: &'a ProjectionTables,
        config: &'a SyncConfig,
    ) -> FullSynchronizer<'a> {
        FullSynchronizer {
            connection,
            tables,
            config,
        }
    }

    /// Builds, loads and swaps in a new projection, then snapshots its checksums.
    ///
    /// On failure the working table is dropped and the production table is left as it was.
    pub async fn run(&self) -> MarctResult<FullSyncSummary> {
        info!(target_table = %self.tables.target, "starting full rebuild");

        let reader = PgClient::connect(self.connection, ConnectionRole::Reader).await?;
        let writer = PgClient::connect(self.connection, ConnectionRole::Writer).await?;

        let working = &self.tables.working;
        writer
            .batch_execute(&format!(
                "{}; {}",
                drop_table_sql(working),
                create_projection_table_sql(working)
            ))
            .await?;

        match self.build(&reader, &writer).await {
            Ok(summary) => {
                info!(
                    records_read = summary.records_read,
                    records_skipped = summary.records_skipped,
                    rows_loaded = summary.rows_loaded,
                    "completed full rebuild"
                );

                Ok(summary)
            }
            Err(err) => {
                if let Err(drop_err) = writer.batch_execute(&drop_table_sql(working)).await {
                    warn!(error = %drop_err, table = %working, "failed to drop working table");
                }

                Err(err)
            }
        }
    }

    async fn build(&self, reader: &PgClient, writer: &PgClient) -> MarctResult<FullSyncSummary> {
        let mut summary = FullSyncSummary::default();
        let mut partitions = PartitionManager::new(self.tables.working.clone());

        self.enable_compression(writer).await;

        let source_rows: i64 = reader
            .query_one(&self.tables.count_source_sql(), &[])
            .await?
            .try_get(0)?;
        info!(source_rows, "counted source records");

        if source_rows > 0 {
            let mut staging = StagingStore::create(&self.config.staging_dir)?;
            self.stage(reader, writer, &mut staging, &mut partitions, &mut summary)
                .await?;
            staging.finish_writing()?;

            summary.rows_loaded = self.load(writer, &mut staging).await?;
            self.create_indexes(writer).await?;
        }

        self.swap(writer, &partitions).await?;
        self.grant(writer).await?;

        writer.begin_tx().await?;
        let snapshot = if summary.rows_loaded > 0 {
            checksum::create_snapshot(writer, self.tables).await
        } else {
            // An empty projection has no records to compare against.
            checksum::drop_snapshot(writer, self.tables).await.map(|()| 0)
        };
        summary.checksum_entries = finish_tx(writer, snapshot).await?;

        writer
            .batch_execute(&format!(
                "analyze {}",
                self.tables.target.as_quoted_identifier()
            ))
            .await?;

        Ok(summary)
    }

    /// Switches the content column to lz4 where the server supports it.
    async fn enable_compression(&self, writer: &PgClient) {
        if !meets_version(writer.server_version(), POSTGRES_14) {
            debug!("server predates column compression, keeping default");
            return;
        }

        let statement = format!(
            "alter table {} alter column content set compression lz4",
            self.tables.working.as_quoted_identifier()
        );
        if let Err(err) = writer.batch_execute(&statement).await {
            debug!(error = %err, "lz4 compression unavailable, keeping default");
        }
    }

    /// Transforms every current source record into the staging store.
    async fn stage(
        &self,
        reader: &PgClient,
        writer: &PgClient,
        staging: &mut StagingStore,
        partitions: &mut PartitionManager,
        summary: &mut FullSyncSummary,
    ) -> MarctResult<()> {
        reader.begin_snapshot_tx().await?;
        let mut scan = SourceScan::open(
            reader,
            FULL_CURSOR,
            &self.tables.source_query(SourceFilter::Current),
            self.config.cursor_fetch_size,
        )
        .await?;

        while let Some(record) = scan.next_record().await? {
            summary.records_read += 1;

            let projection = match project_record(&record) {
                Ok(projection) => projection,
                Err(err) => {
                    warn!(record_id = %record.id, error = %err, "skipping record that could not be parsed");
                    summary.records_skipped += 1;
                    continue;
                }
            };

            for row in &projection.rows {
                if let Some(category) = row.category() {
                    partitions.ensure(writer, category, &row.sf).await?;
                }

                match staging.write(row)? {
                    WriteOutcome::Written => summary.rows_produced += 1,
                    WriteOutcome::Skipped(message) => {
                        warn!(record_id = %record.id, "{message}");
                        summary.rows_skipped += 1;
                    }
                }
            }

            if summary.records_read % 100_000 == 0 {
                info!(
                    records_read = summary.records_read,
                    rows_produced = summary.rows_produced,
                    "transforming source records"
                );
            }
        }

        scan.close().await?;
        reader.commit_tx().await?;

        info!(
            records_read = summary.records_read,
            records_skipped = summary.records_skipped,
            rows_produced = summary.rows_produced,
            "staged projected rows"
        );

        Ok(())
    }

    /// Copies each category's staged rows into its partition, one category at a time.
    async fn load(&self, writer: &PgClient, staging: &mut StagingStore) -> MarctResult<u64> {
        let mut total_rows = 0;

        for category in staging.categories() {
            let Some(mut rows) = staging.reader(category)? else {
                continue;
            };

            let partition = field_partition_name(&self.tables.working, category);
            let copied = writer.copy_rows(&partition, &mut rows).await?;
            rows.finish()?;

            debug!(%category, copied, "loaded category");
            total_rows += copied;
        }

        info!(total_rows, "loaded staged rows");

        Ok(total_rows)
    }

    async fn create_indexes(&self, writer: &PgClient) -> MarctResult<()> {
        let working = &self.tables.working;
        for statement in create_index_statements(working) {
            writer.batch_execute(&statement).await?;
        }

        if !self.config.trigram_index {
            return Ok(());
        }

        let probe = PgClient::connect(self.connection, ConnectionRole::Probe).await?;
        let available: bool = probe
            .query_one(
                "select exists (select 1 from pg_extension where extname = 'pg_trgm')",
                &[],
            )
            .await?
            .try_get(0)?;
        drop(probe);

        if !available {
            info!("pg_trgm is not installed, skipping trigram index");
            return Ok(());
        }

        if let Err(err) = writer.batch_execute(&create_trigram_index_sql(working)).await {
            info!(error = %err, "trigram index could not be created, continuing without it");
        }

        Ok(())
    }

    /// Replaces the production table with the working table in one transaction.
    async fn swap(&self, writer: &PgClient, partitions: &PartitionManager) -> MarctResult<()> {
        writer.begin_tx().await?;
        let result = self.swap_in_tx(writer, partitions).await;
        finish_tx(writer, result).await?;

        info!(table = %self.tables.target, "swapped in rebuilt projection");

        Ok(())
    }

    async fn swap_in_tx(&self, writer: &PgClient, partitions: &PartitionManager) -> MarctResult<()> {
        let target = &self.tables.target;

        writer.batch_execute(&drop_table_sql(target)).await?;
        writer
            .batch_execute(&format!(
                "alter table {} rename to {}",
                self.tables.working.as_quoted_identifier(),
                quote_identifier(&target.name)
            ))
            .await?;

        for (from, to) in partitions.renames_for(target) {
            writer
                .batch_execute(&format!(
                    "alter table {} rename to {}",
                    from.as_quoted_identifier(),
                    quote_identifier(&to)
                ))
                .await?;
        }

        // Entries of the replaced projection must not outlive it, even if a later step fails.
        checksum::drop_snapshot(writer, self.tables).await
    }

    async fn grant(&self, writer: &PgClient) -> MarctResult<()> {
        for account in &self.config.consumer_accounts {
            writer
                .batch_execute(&format!(
                    "grant select on {} to {}",
                    self.tables.target.as_quoted_identifier(),
                    quote_identifier(account)
                ))
                .await?;
            debug!(account, "granted read access");
        }

        Ok(())
    }

    /// Writes the projection of every current record to `path` instead of the database.
    pub async fn write_file(&self, path: &Path) -> MarctResult<FullSyncSummary> {
        info!(path = %path.display(), "writing projection to file");

        let reader = PgClient::connect(self.connection, ConnectionRole::Reader).await?;
        let mut sink = FileSink::create(path)?;
        let mut summary = FullSyncSummary::default();

        reader.begin_snapshot_tx().await?;
        let mut scan = SourceScan::open(
            &reader,
            FULL_CURSOR,
            &self.tables.source_query(SourceFilter::Current),
            self.config.cursor_fetch_size,
        )
        .await?;

        while let Some(record) = scan.next_record().await? {
            summary.records_read += 1;

            match project_record(&record) {
                Ok(projection) => {
                    for row in &projection.rows {
                        sink.write_row(row)?;
                    }
                    summary.rows_produced += projection.rows.len() as u64;
                }
                Err(err) => {
                    warn!(record_id = %record.id, error = %err, "skipping record that could not be parsed");
                    summary.records_skipped += 1;
                }
            }
        }

        scan.close().await?;
        reader.commit_tx().await?;
        sink.finish()?;

        Ok(summary)
    }
}
