//! Encoding of identifier strings into the projection's native UUID form.

use tracing::warn;
use uuid::Uuid;

/// Parses `value` as a UUID.
///
/// Invalid input never fails the row: a warning naming `source_id` is logged and the nil UUID is
/// returned instead.
pub fn encode_identifier(value: &str, source_id: &str) -> Uuid {
    match Uuid::parse_str(value.trim()) {
        Ok(uuid) => uuid,
        Err(err) => {
            warn!(
                source_id,
                value,
                error = %err,
                "invalid identifier, substituting nil uuid"
            );

            Uuid::nil()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_identifiers_are_parsed() {
        let uuid = encode_identifier("6f1c8b2e-6b4c-4b8e-9f3a-2d1e0c9b8a71", "rec-1");

        assert_eq!(uuid.to_string(), "6f1c8b2e-6b4c-4b8e-9f3a-2d1e0c9b8a71");
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        let uuid = encode_identifier(" 6f1c8b2e-6b4c-4b8e-9f3a-2d1e0c9b8a71\n", "rec-1");

        assert!(!uuid.is_nil());
    }

    #[test]
    fn invalid_identifiers_become_nil() {
        assert!(encode_identifier("inst-42", "rec-1").is_nil());
        assert!(encode_identifier("", "rec-1").is_nil());
    }
}
