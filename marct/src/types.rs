use std::fmt;

use uuid::Uuid;

/// Number of distinct field categories, `000` through `999`.
pub const CATEGORY_COUNT: usize = 1000;

/// A three-digit MARC field code in the range `000`..=`999`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Category(u16);

impl Category {
    /// Parses a field code. Only exactly three ASCII digits are accepted.
    pub fn parse(code: &str) -> Option<Category> {
        let bytes = code.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_digit) {
            return None;
        }

        let value = bytes
            .iter()
            .fold(0u16, |acc, digit| acc * 10 + u16::from(digit - b'0'));

        Some(Category(value))
    }

    pub fn from_index(index: usize) -> Option<Category> {
        (index < CATEGORY_COUNT).then_some(Category(index as u16))
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Iterates over every category in ascending order.
    pub fn all() -> impl Iterator<Item = Category> {
        (0..CATEGORY_COUNT as u16).map(Category)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// One source record joined with its content, as read from the source relations.
///
/// Every column is read as text; absent values are empty strings. `digest` is computed by the
/// server with the same expression used for the checksum snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub id: String,
    pub matched_id: String,
    pub external_hrid: String,
    pub state: String,
    pub content: String,
    pub digest: String,
}

/// A flattened row of the projection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedRow {
    pub srs_id: Uuid,
    pub line: i32,
    pub matched_id: Uuid,
    pub instance_hrid: String,
    pub instance_id: Uuid,
    pub field: String,
    pub ind1: String,
    pub ind2: String,
    pub ord: i32,
    pub sf: String,
    pub content: String,
}

impl ProjectedRow {
    /// Returns the category of this row, if its field code is one of the 1000 known codes.
    pub fn category(&self) -> Option<Category> {
        Category::parse(&self.field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_only_three_digit_codes() {
        assert_eq!(Category::parse("000").map(Category::index), Some(0));
        assert_eq!(Category::parse("245").map(Category::index), Some(245));
        assert_eq!(Category::parse("999").map(Category::index), Some(999));

        assert_eq!(Category::parse("24"), None);
        assert_eq!(Category::parse("2450"), None);
        assert_eq!(Category::parse("LDR"), None);
        assert_eq!(Category::parse("-12"), None);
    }

    #[test]
    fn displays_zero_padded() {
        assert_eq!(Category::parse("001").map(|c| c.to_string()).as_deref(), Some("001"));
        assert_eq!(Category::from_index(7).map(|c| c.to_string()).as_deref(), Some("007"));
        assert_eq!(Category::from_index(1000), None);
    }

    #[test]
    fn all_covers_every_category_in_order() {
        let all: Vec<_> = Category::all().collect();

        assert_eq!(all.len(), CATEGORY_COUNT);
        assert!(all.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
