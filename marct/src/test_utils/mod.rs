//! Helpers for tests that run against a real Postgres server.
//!
//! [`database`] creates an isolated database per test from the `TESTS_DATABASE_*` environment
//! variables, [`source`] creates and mutates the source relations and reads back the projection.

pub mod database;
pub mod source;
