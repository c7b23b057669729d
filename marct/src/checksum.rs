//! The checksum snapshot that lets incremental runs find changed records.
//!
//! The snapshot is a `{table}__cksum (id, cksum)` relation with one digest per record present in
//! the projection, accompanied by a one-row `{table}__metadata (version)` relation. Incremental
//! runs are only offered when the stored version equals [`SCHEMA_VERSION`].

use tracing::{debug, info};
use uuid::Uuid;

use crate::client::PgClient;
use crate::error::MarctResult;
use crate::schema::{
    ProjectionTables, create_checksum_table_sql, create_metadata_table_sql, drop_table_sql,
};

/// Version of the projection and snapshot layout written by this engine.
pub const SCHEMA_VERSION: i32 = 2;

/// What the database holds in place of a usable snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// Snapshot, metadata and projection all exist and the version matches.
    Compatible,
    /// One of the snapshot relations or the projection itself is absent.
    Missing,
    /// The metadata row is absent or records another version.
    VersionMismatch { found: Option<i32> },
}

/// Inspects the snapshot relations of `tables`.
pub async fn snapshot_status(
    client: &PgClient,
    tables: &ProjectionTables,
) -> MarctResult<SnapshotStatus> {
    let row = client
        .query_one(
            "select to_regclass($1) is not null, to_regclass($2) is not null, to_regclass($3) is not null",
            &[
                &tables.target.as_quoted_identifier(),
                &tables.checksum.as_quoted_identifier(),
                &tables.metadata.as_quoted_identifier(),
            ],
        )
        .await?;

    let (target, checksum, metadata): (bool, bool, bool) =
        (row.try_get(0)?, row.try_get(1)?, row.try_get(2)?);
    if !(target && checksum && metadata) {
        debug!(target, checksum, metadata, "checksum snapshot incomplete");
        return Ok(SnapshotStatus::Missing);
    }

    let found: Option<i32> = client
        .query_opt(
            &format!(
                "select version from {} limit 1",
                tables.metadata.as_quoted_identifier()
            ),
            &[],
        )
        .await?
        .map(|row| row.try_get(0))
        .transpose()?;

    match found {
        Some(SCHEMA_VERSION) => Ok(SnapshotStatus::Compatible),
        found => Ok(SnapshotStatus::VersionMismatch { found }),
    }
}

/// Replaces the snapshot with digests of every record now present in the projection and stamps
/// the metadata version.
///
/// Must run inside the caller's transaction so that the old snapshot stays visible until commit.
pub async fn create_snapshot(client: &PgClient, tables: &ProjectionTables) -> MarctResult<u64> {
    drop_snapshot(client, tables).await?;

    client
        .batch_execute(&create_checksum_table_sql(&tables.checksum))
        .await?;
    let entries = client
        .execute(&tables.snapshot_checksums_sql(), &[])
        .await?;

    client
        .batch_execute(&create_metadata_table_sql(&tables.metadata))
        .await?;
    client
        .execute(
            &format!(
                "insert into {} (version) values ($1)",
                tables.metadata.as_quoted_identifier()
            ),
            &[&SCHEMA_VERSION],
        )
        .await?;

    info!(entries, table = %tables.checksum, "checksum snapshot written");

    Ok(entries)
}

/// Removes the snapshot relations if they exist.
pub async fn drop_snapshot(client: &PgClient, tables: &ProjectionTables) -> MarctResult<()> {
    client
        .batch_execute(&format!(
            "{}; {}",
            drop_table_sql(&tables.checksum),
            drop_table_sql(&tables.metadata)
        ))
        .await
}

pub async fn insert_entry(
    client: &PgClient,
    tables: &ProjectionTables,
    id: Uuid,
    digest: &str,
) -> MarctResult<()> {
    client
        .execute(
            &format!(
                "insert into {} (id, cksum) values ($1, $2)",
                tables.checksum.as_quoted_identifier()
            ),
            &[&id, &digest],
        )
        .await?;

    Ok(())
}

pub async fn delete_entry(client: &PgClient, tables: &ProjectionTables, id: Uuid) -> MarctResult<u64> {
    client
        .execute(
            &format!(
                "delete from {} where id = $1",
                tables.checksum.as_quoted_identifier()
            ),
            &[&id],
        )
        .await
}
