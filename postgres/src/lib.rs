pub mod schema;
#[cfg(feature = "test-utils")]
pub mod test_utils;
pub mod version;
