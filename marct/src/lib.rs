//! Projection of MARC JSON source records into a flat, partitioned Postgres table.
//!
//! A [`sync::Synchronizer`] either rebuilds the projection completely or applies the additions,
//! deletions and changes found by comparing source digests with the checksum snapshot of the
//! last rebuild.

pub mod checksum;
pub mod client;
pub mod error;
pub mod file_sink;
pub mod identity;
mod macros;
pub mod partition;
pub mod schema;
pub mod staging;
pub mod sync;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transform;
pub mod types;
