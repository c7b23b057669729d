use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("Invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
    /// A table or column name resolved to an empty string.
    #[error("Invalid layout config: `{0}` cannot be empty")]
    EmptyLayoutName(&'static str),
    /// The incremental deadline cannot be zero.
    #[error("`incremental_deadline_secs` cannot be zero")]
    IncrementalDeadlineZero,
    /// The cursor fetch size cannot be zero.
    #[error("`cursor_fetch_size` cannot be zero")]
    CursorFetchSizeZero,
}
