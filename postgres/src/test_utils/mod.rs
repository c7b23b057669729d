//! Helpers for tests that need a real, isolated Postgres database.

mod database;

pub use database::{PgDatabase, create_pg_database, drop_pg_database};
