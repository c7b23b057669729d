use marct_config::shared::{
    PgConnectionConfig, SyncConfig, TableLayout, TlsConfig,
};
use marct_postgres::test_utils::PgDatabase;
use uuid::Uuid;

/// Schema holding the source relations and the projection in tests.
pub const TEST_DATABASE_SCHEMA: &str = "test";

/// Connection configuration for a new, uniquely named database.
///
/// Configuration is read from environment variables:
/// - `TESTS_DATABASE_HOST`: Postgres server hostname (required)
/// - `TESTS_DATABASE_PORT`: Postgres server port (required)
/// - `TESTS_DATABASE_USERNAME`: Database user (required)
/// - `TESTS_DATABASE_PASSWORD`: Database password (optional)
pub fn local_pg_connection_config() -> PgConnectionConfig {
    PgConnectionConfig {
        host: std::env::var("TESTS_DATABASE_HOST").expect("TESTS_DATABASE_HOST must be set"),
        port: std::env::var("TESTS_DATABASE_PORT")
            .expect("TESTS_DATABASE_PORT must be set")
            .parse()
            .expect("TESTS_DATABASE_PORT must be a valid port number"),
        name: Uuid::new_v4().to_string(),
        username: std::env::var("TESTS_DATABASE_USERNAME")
            .expect("TESTS_DATABASE_USERNAME must be set"),
        password: std::env::var("TESTS_DATABASE_PASSWORD")
            .ok()
            .map(Into::into),
        tls: TlsConfig::disabled(),
        keepalive: None,
    }
}

/// Layout with every relation in [`TEST_DATABASE_SCHEMA`].
pub fn test_layout() -> TableLayout {
    TableLayout {
        records_schema: TEST_DATABASE_SCHEMA.to_owned(),
        records_table: "records".to_owned(),
        content_schema: TEST_DATABASE_SCHEMA.to_owned(),
        content_table: "marc_records".to_owned(),
        id_column: "id".to_owned(),
        matched_id_column: "matched_id".to_owned(),
        external_hrid_column: "external_hrid".to_owned(),
        state_column: "state".to_owned(),
        content_column: "content".to_owned(),
        target_schema: TEST_DATABASE_SCHEMA.to_owned(),
        target_table: "marctab".to_owned(),
    }
}

/// Sync settings for tests: staging under the system temp directory, small cursor batches.
pub fn test_sync_config() -> SyncConfig {
    SyncConfig {
        cursor_fetch_size: 2,
        ..SyncConfig::default()
    }
}

/// Creates a fresh database holding the empty source relations of [`test_layout`].
///
/// # Panics
///
/// Panics if the schema or the source relations cannot be created.
pub async fn spawn_database() -> PgDatabase {
    let database = PgDatabase::new(local_pg_connection_config()).await;

    database
        .run_sql(&format!(
            "create schema {TEST_DATABASE_SCHEMA};
             create table {TEST_DATABASE_SCHEMA}.records (
                 id uuid primary key,
                 matched_id uuid,
                 external_hrid varchar,
                 state varchar not null
             );
             create table {TEST_DATABASE_SCHEMA}.marc_records (
                 id uuid primary key,
                 content jsonb not null
             );"
        ))
        .await;

    database
}
