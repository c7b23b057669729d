//! Postgres server version constants and helpers.
//!
//! Version numbers follow Postgres' internal format: `MAJOR * 10000 + MINOR`.

use std::num::NonZeroI32;

pub const POSTGRES_14: i32 = 140000;
pub const POSTGRES_15: i32 = 150000;
pub const POSTGRES_16: i32 = 160000;

/// Returns [`true`] if the server version meets or exceeds the required version.
///
/// A missing server version never meets a requirement.
pub fn meets_version(server_version: Option<NonZeroI32>, required_version: i32) -> bool {
    server_version.is_some_and(|v| v.get() >= required_version)
}

/// Parses the `server_version` startup parameter, e.g. `16.2 (Debian 16.2-1.pgdg120+2)`.
pub fn extract_server_version(server_version_str: impl AsRef<str>) -> Option<NonZeroI32> {
    let version_part = server_version_str
        .as_ref()
        .split_whitespace()
        .next()
        .unwrap_or("0.0");

    let mut components = version_part.split('.');

    let major = components
        .next()
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0);
    let minor = components
        .next()
        .and_then(|v| {
            v.trim_end_matches(|c: char| !c.is_ascii_digit())
                .parse::<i32>()
                .ok()
        })
        .unwrap_or(0);

    NonZeroI32::new(major * 10000 + minor)
}
