//! Postgres connections used by a projection run.
//!
//! A run holds up to three independent sessions: a reader owning the source cursor, a writer
//! owning the write transaction and a short-lived probe. Each [`PgClient`] wraps exactly one
//! session and is never shared between those roles.

use std::fmt;
use std::io::BufReader;
use std::num::NonZeroI32;

use marct_config::shared::{
    IntoConnectOptions, MARCT_PROBE_OPTIONS, MARCT_READER_OPTIONS, MARCT_WRITER_OPTIONS,
    PgConnectionConfig, PgConnectionOptions,
};
use marct_postgres::schema::TableName;
use marct_postgres::version::extract_server_version;
use pg_escape::quote_identifier;
use rustls::ClientConfig;
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Config, Connection, NoTls, Row, Socket, Statement, ToStatement};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{Instrument, debug, error, info};

use crate::error::MarctResult;
use crate::schema::PROJECTION_COLUMNS;
use crate::types::{ProjectedRow, SourceRecord};

/// Column types of the projection table, in [`PROJECTION_COLUMNS`] order.
const PROJECTION_TYPES: [Type; 11] = [
    Type::UUID,
    Type::INT4,
    Type::UUID,
    Type::VARCHAR,
    Type::UUID,
    Type::VARCHAR,
    Type::VARCHAR,
    Type::VARCHAR,
    Type::INT4,
    Type::VARCHAR,
    Type::VARCHAR,
];

/// The purpose a session is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Reader,
    Writer,
    Probe,
}

impl ConnectionRole {
    fn options(self) -> &'static PgConnectionOptions {
        match self {
            ConnectionRole::Reader => &*MARCT_READER_OPTIONS,
            ConnectionRole::Writer => &*MARCT_WRITER_OPTIONS,
            ConnectionRole::Probe => &*MARCT_PROBE_OPTIONS,
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Reader => write!(f, "reader"),
            ConnectionRole::Writer => write!(f, "writer"),
            ConnectionRole::Probe => write!(f, "probe"),
        }
    }
}

/// Spawns a background task driving a Postgres connection until it terminates.
fn spawn_postgres_connection<T>(connection: Connection<Socket, T::Stream>, role: ConnectionRole)
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let span = tracing::Span::current();
    let task = async move {
        match connection.await {
            Err(err) => error!(%role, "an error occurred during the postgres connection: {}", err),
            Ok(()) => debug!(%role, "postgres connection terminated successfully"),
        }
    }
    .instrument(span);

    // The connection ends when the owning `Client` is dropped, so the handle is not tracked.
    tokio::spawn(task);
}

/// A single Postgres session.
#[derive(Debug)]
pub struct PgClient {
    client: Client,
    server_version: Option<NonZeroI32>,
    role: ConnectionRole,
}

impl PgClient {
    /// Opens a session for `role`, using TLS when the configuration enables it.
    pub async fn connect(config: &PgConnectionConfig, role: ConnectionRole) -> MarctResult<Self> {
        match config.tls.enabled {
            true => PgClient::connect_tls(config, role).await,
            false => PgClient::connect_no_tls(config, role).await,
        }
    }

    async fn connect_no_tls(config: &PgConnectionConfig, role: ConnectionRole) -> MarctResult<Self> {
        let pg_config: Config = config.with_db(Some(role.options()));
        let (client, connection) = pg_config.connect(NoTls).await?;

        let server_version = connection
            .parameter("server_version")
            .and_then(extract_server_version);

        spawn_postgres_connection::<NoTls>(connection, role);

        info!(%role, "connected to postgres without tls");

        Ok(PgClient {
            client,
            server_version,
            role,
        })
    }

    async fn connect_tls(config: &PgConnectionConfig, role: ConnectionRole) -> MarctResult<Self> {
        let pg_config: Config = config.with_db(Some(role.options()));

        let mut root_store = rustls::RootCertStore::empty();
        let mut root_certs_reader = BufReader::new(config.tls.trusted_root_certs.as_bytes());
        for cert in rustls_pemfile::certs(&mut root_certs_reader) {
            root_store.add(cert?)?;
        }

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let (client, connection) = pg_config.connect(MakeRustlsConnect::new(tls_config)).await?;

        let server_version = connection
            .parameter("server_version")
            .and_then(extract_server_version);

        spawn_postgres_connection::<MakeRustlsConnect>(connection, role);

        info!(%role, "connected to postgres with tls");

        Ok(PgClient {
            client,
            server_version,
            role,
        })
    }

    pub fn server_version(&self) -> Option<NonZeroI32> {
        self.server_version
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Starts a plain read-write transaction.
    pub async fn begin_tx(&self) -> MarctResult<()> {
        self.client.simple_query("begin;").await?;

        Ok(())
    }

    /// Starts a repeatable read transaction, so that every query of a scan sees one snapshot.
    pub async fn begin_snapshot_tx(&self) -> MarctResult<()> {
        self.client
            .simple_query("begin isolation level repeatable read;")
            .await?;

        Ok(())
    }

    /// Commits the current transaction.
    pub async fn commit_tx(&self) -> MarctResult<()> {
        self.client.simple_query("commit;").await?;

        Ok(())
    }

    /// Rolls back the current transaction.
    pub async fn rollback_tx(&self) -> MarctResult<()> {
        self.client.simple_query("rollback;").await?;

        Ok(())
    }

    /// Runs one or more statements through the simple query protocol.
    pub async fn batch_execute(&self, sql: &str) -> MarctResult<()> {
        self.client.batch_execute(sql).await?;

        Ok(())
    }

    /// Prepares a statement for repeated execution on this session.
    pub async fn prepare(&self, sql: &str) -> MarctResult<Statement> {
        Ok(self.client.prepare(sql).await?)
    }

    /// Runs a parameterized statement and returns the number of affected rows.
    pub async fn execute<T>(&self, statement: &T, params: &[&(dyn ToSql + Sync)]) -> MarctResult<u64>
    where
        T: ?Sized + ToStatement,
    {
        Ok(self.client.execute(statement, params).await?)
    }

    pub async fn query<T>(&self, statement: &T, params: &[&(dyn ToSql + Sync)]) -> MarctResult<Vec<Row>>
    where
        T: ?Sized + ToStatement,
    {
        Ok(self.client.query(statement, params).await?)
    }

    pub async fn query_one<T>(&self, statement: &T, params: &[&(dyn ToSql + Sync)]) -> MarctResult<Row>
    where
        T: ?Sized + ToStatement,
    {
        Ok(self.client.query_one(statement, params).await?)
    }

    pub async fn query_opt<T>(
        &self,
        statement: &T,
        params: &[&(dyn ToSql + Sync)],
    ) -> MarctResult<Option<Row>>
    where
        T: ?Sized + ToStatement,
    {
        Ok(self.client.query_opt(statement, params).await?)
    }

    /// Declares a forward-only cursor over `query` in the current transaction.
    pub async fn declare_cursor<'a>(
        &'a self,
        name: &str,
        query: &str,
        fetch_size: u32,
    ) -> MarctResult<PgCursor<'a>> {
        let name = quote_identifier(name).into_owned();
        self.client
            .batch_execute(&format!("declare {name} no scroll cursor for {query}"))
            .await?;

        Ok(PgCursor {
            client: self,
            name,
            fetch_size,
            exhausted: false,
        })
    }

    /// Streams `rows` into `table` with a binary `COPY`, returning the number of copied rows.
    pub async fn copy_rows<I>(&self, table: &TableName, rows: I) -> MarctResult<u64>
    where
        I: IntoIterator<Item = ProjectedRow>,
    {
        let statement = format!(
            "copy {} ({}) from stdin (format binary)",
            table.as_quoted_identifier(),
            PROJECTION_COLUMNS.join(", ")
        );
        let sink = self.client.copy_in(&statement).await?;
        let writer = BinaryCopyInWriter::new(sink, &PROJECTION_TYPES);
        tokio::pin!(writer);

        for row in rows {
            writer.as_mut().write(&projection_params(&row)).await?;
        }

        Ok(writer.finish().await?)
    }
}

/// Returns the parameters of `row` in [`PROJECTION_COLUMNS`] order.
pub fn projection_params(row: &ProjectedRow) -> [&(dyn ToSql + Sync); 11] {
    [
        &row.srs_id,
        &row.line,
        &row.matched_id,
        &row.instance_hrid,
        &row.instance_id,
        &row.field,
        &row.ind1,
        &row.ind2,
        &row.ord,
        &row.sf,
        &row.content,
    ]
}

/// A server-side cursor fetched in fixed-size batches.
#[derive(Debug)]
pub struct PgCursor<'a> {
    client: &'a PgClient,
    name: String,
    fetch_size: u32,
    exhausted: bool,
}

impl PgCursor<'_> {
    /// Fetches the next batch of rows, or [`None`] once the cursor is drained.
    pub async fn next_batch(&mut self) -> MarctResult<Option<Vec<Row>>> {
        if self.exhausted {
            return Ok(None);
        }

        let rows = self
            .client
            .query(
                &format!("fetch forward {} from {}", self.fetch_size, self.name),
                &[],
            )
            .await?;

        if rows.len() < self.fetch_size as usize {
            self.exhausted = true;
        }
        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(rows))
    }

    /// Closes the cursor. The surrounding transaction stays open.
    pub async fn close(self) -> MarctResult<()> {
        self.client
            .batch_execute(&format!("close {}", self.name))
            .await
    }
}

impl SourceRecord {
    /// Reads a record from a row shaped by [`crate::schema::ProjectionTables::source_query`].
    pub fn from_row(row: &Row) -> MarctResult<SourceRecord> {
        Ok(SourceRecord {
            id: row.try_get(0)?,
            matched_id: row.try_get(1)?,
            external_hrid: row.try_get(2)?,
            state: row.try_get(3)?,
            content: row.try_get(4)?,
            digest: row.try_get(5)?,
        })
    }
}
