//! Shared configuration types for the syncer and its tests.

mod base;
mod connection;
mod layout;
mod sync;
mod syncer;

pub use base::ValidationError;
pub use connection::{
    IntoConnectOptions, MARCT_PROBE_OPTIONS, MARCT_READER_OPTIONS, MARCT_WRITER_OPTIONS,
    PgConnectionConfig, PgConnectionConfigWithoutSecrets, PgConnectionOptions,
    TcpKeepaliveConfig, TlsConfig,
};
pub use layout::{DeploymentProfile, LayoutConfig, LayoutOverrides, TableLayout};
pub use sync::SyncConfig;
pub use syncer::{SyncerConfig, SyncerConfigWithoutSecrets};
