//! Configuration types and loading for marct.
//!
//! Holds the connection settings for the database that hosts both the source records and the
//! projection, the per-deployment table layout and the synchronization settings.

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{Config, LoadConfigError, load_config, load_config_from};
