use marct_config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::{Connection, Executor, PgConnection};
use tokio::runtime::Handle;
use tokio_postgres::{Client, NoTls};
use tracing::error;

/// A uniquely named test database that is dropped together with this value.
///
/// Dropping requires a multi-threaded tokio runtime, so tests using it must run with
/// `#[tokio::test(flavor = "multi_thread")]`.
pub struct PgDatabase {
    pub config: PgConnectionConfig,
    pub client: Option<Client>,
    destroy_on_drop: bool,
}

impl PgDatabase {
    /// Creates the database named in `config` and connects to it.
    pub async fn new(config: PgConnectionConfig) -> Self {
        create_pg_database(&config).await;
        let client = connect(&config).await;

        Self {
            config,
            client: Some(client),
            destroy_on_drop: true,
        }
    }

    /// Opens another connection to the same database without taking ownership of it.
    pub async fn duplicate(&self) -> Self {
        let client = connect(&self.config).await;

        Self {
            config: self.config.clone(),
            client: Some(client),
            destroy_on_drop: false,
        }
    }

    /// Returns the connected client.
    pub fn client(&self) -> &Client {
        self.client
            .as_ref()
            .expect("test database client is only taken on drop")
    }

    /// Executes a batch of SQL statements.
    pub async fn run_sql(&self, sql: &str) {
        self.client()
            .batch_execute(sql)
            .await
            .expect("Failed to run test sql");
    }
}

impl Drop for PgDatabase {
    fn drop(&mut self) {
        // Close our own connection first so the database can be dropped.
        self.client.take();

        if self.destroy_on_drop {
            tokio::task::block_in_place(move || {
                Handle::current().block_on(async move { drop_pg_database(&self.config).await });
            });
        }
    }
}

async fn connect(config: &PgConnectionConfig) -> Client {
    let tokio_config: tokio_postgres::Config = config.with_db(None);
    let (client, connection) = tokio_config
        .connect(NoTls)
        .await
        .expect("Failed to connect to test database");

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!("test database connection error: {err}");
        }
    });

    client
}

/// Creates a new Postgres database named after [`PgConnectionConfig::name`].
///
/// # Panics
/// Panics if connection or database creation fails.
pub async fn create_pg_database(config: &PgConnectionConfig) {
    let mut connection = PgConnection::connect_with(&config.without_db(None))
        .await
        .expect("Failed to connect to Postgres");
    connection
        .execute(&*format!(r#"create database "{}";"#, config.name))
        .await
        .expect("Failed to create database");
}

/// Drops a Postgres database after terminating its remaining connections.
///
/// Never panics: cleanup failures are reported on stderr.
pub async fn drop_pg_database(config: &PgConnectionConfig) {
    let mut connection = match PgConnection::connect_with(&config.without_db(None)).await {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("warning: failed to connect to Postgres for cleanup: {e}");
            return;
        }
    };

    if let Err(e) = connection
        .execute(&*format!(
            r#"
            select pg_terminate_backend(pg_stat_activity.pid)
            from pg_stat_activity
            where pg_stat_activity.datname = '{}'
            and pid <> pg_backend_pid();"#,
            config.name
        ))
        .await
    {
        eprintln!(
            "warning: failed to terminate connections for database {}: {}",
            config.name, e
        );
    }

    if let Err(e) = connection
        .execute(&*format!(r#"drop database if exists "{}";"#, config.name))
        .await
    {
        eprintln!("warning: failed to drop database {}: {}", config.name, e);
    }
}
