//! Flattening of MARC JSON records into projection rows.
//!
//! A record is an object with a `leader` string and a `fields` array whose entries are
//! single-key objects. Control fields map a field code to a string, data fields map it to an
//! object holding two indicators and a `subfields` array of single-key `{code: value}` objects.
//! Every emitted row takes the next value of a record-wide line counter, while `ord` counts the
//! occurrences of each field code separately.

use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::identity::encode_identifier;
use crate::types::{ProjectedRow, SourceRecord};

/// Lifecycle state of records that belong in the projection.
pub const CURRENT_STATE: &str = "ACTUAL";

const INSTANCE_ID_FIELD: &str = "999";
const INSTANCE_ID_SUBFIELD: &str = "i";
const INSTANCE_ID_INDICATOR: &str = "f";

/// Structural problems that reject a whole record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("record content is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("record content is not a JSON object")]
    NotAnObject,

    #[error("record has no string \"leader\"")]
    MissingLeader,

    #[error("record has no \"fields\" array")]
    MissingFields,

    #[error("fields entry {index} is not an object with exactly one key")]
    MalformedFieldEntry { index: usize },

    #[error("field {field} is neither a string nor an object")]
    InvalidFieldValue { field: String },

    #[error("field {field} has no string indicator \"{name}\"")]
    MissingIndicator { field: String, name: &'static str },

    #[error("field {field} has no \"subfields\" array")]
    MissingSubfields { field: String },

    #[error("field {field} has a malformed subfield at position {index}")]
    MalformedSubfield { field: String, index: usize },

    #[error("record has {count} qualifying 999 $i instance identifiers")]
    DuplicateInstanceId { count: usize },
}

/// One row of a flattened record, before the record's identity is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarcRow {
    pub line: i32,
    pub field: String,
    pub ind1: String,
    pub ind2: String,
    pub ord: i32,
    pub sf: String,
    pub content: String,
}

/// Result of flattening one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformOutput {
    /// Rows in emission order. Empty when the record is not current.
    pub rows: Vec<MarcRow>,
    /// Content of the qualifying 999 $i row, or empty when there is none.
    pub instance_id: String,
}

/// Flattens the JSON text of a record.
pub fn transform(content: &str, state: &str) -> Result<TransformOutput, TransformError> {
    let record: Value =
        serde_json::from_str(content).map_err(|err| TransformError::InvalidJson(err.to_string()))?;

    transform_value(&record, state)
}

/// Flattens an already parsed record.
pub fn transform_value(record: &Value, state: &str) -> Result<TransformOutput, TransformError> {
    let record = record.as_object().ok_or(TransformError::NotAnObject)?;
    let leader = record
        .get("leader")
        .and_then(Value::as_str)
        .ok_or(TransformError::MissingLeader)?;
    let fields = record
        .get("fields")
        .and_then(Value::as_array)
        .ok_or(TransformError::MissingFields)?;

    let mut builder = RowBuilder::default();
    for (index, entry) in fields.iter().enumerate() {
        let (field, value) =
            single_entry(entry).ok_or(TransformError::MalformedFieldEntry { index })?;
        let ord = builder.next_ord(field);

        match value {
            Value::String(content) => {
                if field == "001" {
                    builder.push("000", "", "", ord, "", leader);
                }
                builder.push(field, "", "", ord, "", content);
            }
            Value::Object(data) => {
                let ind1 = indicator(field, data, "ind1")?;
                let ind2 = indicator(field, data, "ind2")?;
                let subfields = data.get("subfields").and_then(Value::as_array).ok_or_else(|| {
                    TransformError::MissingSubfields {
                        field: field.to_owned(),
                    }
                })?;

                for (index, subfield) in subfields.iter().enumerate() {
                    let malformed = || TransformError::MalformedSubfield {
                        field: field.to_owned(),
                        index,
                    };
                    let (code, content) = single_entry(subfield).ok_or_else(malformed)?;
                    let content = content.as_str().ok_or_else(malformed)?;

                    builder.push(field, ind1, ind2, ord, code, content);
                }
            }
            _ => {
                return Err(TransformError::InvalidFieldValue {
                    field: field.to_owned(),
                });
            }
        }
    }

    let mut rows = builder.rows;
    let instance_id = find_instance_id(&rows)?;
    if state != CURRENT_STATE || instance_id.is_empty() {
        rows.clear();
    }

    Ok(TransformOutput { rows, instance_id })
}

/// Rows of one record ready to be written, plus its instance identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordProjection {
    pub rows: Vec<ProjectedRow>,
    pub instance_id: String,
}

/// Flattens a source record and attaches its identity to every row.
///
/// Identifier columns go through [`encode_identifier`], so malformed identifiers yield nil UUIDs
/// rather than errors.
pub fn project_record(record: &SourceRecord) -> Result<RecordProjection, TransformError> {
    let TransformOutput { rows, instance_id } = transform(&record.content, &record.state)?;
    if rows.is_empty() {
        return Ok(RecordProjection {
            rows: Vec::new(),
            instance_id,
        });
    }

    let srs_id = encode_identifier(&record.id, &record.id);
    let matched_id = encode_identifier(&record.matched_id, &record.id);
    let instance_uuid = encode_identifier(&instance_id, &record.id);

    let rows = rows
        .into_iter()
        .map(|row| ProjectedRow {
            srs_id,
            line: row.line,
            matched_id,
            instance_hrid: record.external_hrid.clone(),
            instance_id: instance_uuid,
            field: row.field,
            ind1: row.ind1,
            ind2: row.ind2,
            ord: row.ord,
            sf: row.sf,
            content: row.content,
        })
        .collect();

    Ok(RecordProjection { rows, instance_id })
}

#[derive(Default)]
struct RowBuilder {
    rows: Vec<MarcRow>,
    occurrences: HashMap<String, i32>,
}

impl RowBuilder {
    fn next_ord(&mut self, field: &str) -> i32 {
        let count = self.occurrences.entry(field.to_owned()).or_insert(0);
        *count += 1;
        *count
    }

    fn push(&mut self, field: &str, ind1: &str, ind2: &str, ord: i32, sf: &str, content: &str) {
        let line = self.rows.len() as i32 + 1;
        self.rows.push(MarcRow {
            line,
            field: field.to_owned(),
            ind1: ind1.to_owned(),
            ind2: ind2.to_owned(),
            ord,
            sf: sf.to_owned(),
            content: content.to_owned(),
        });
    }
}

fn single_entry(value: &Value) -> Option<(&str, &Value)> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }

    object.iter().next().map(|(key, value)| (key.as_str(), value))
}

fn indicator<'a>(
    field: &str,
    data: &'a Map<String, Value>,
    name: &'static str,
) -> Result<&'a str, TransformError> {
    data.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| TransformError::MissingIndicator {
            field: field.to_owned(),
            name,
        })
}

fn find_instance_id(rows: &[MarcRow]) -> Result<String, TransformError> {
    let mut qualifying = rows.iter().filter(|row| {
        row.field == INSTANCE_ID_FIELD
            && row.sf == INSTANCE_ID_SUBFIELD
            && row.ind1 == INSTANCE_ID_INDICATOR
            && row.ind2 == INSTANCE_ID_INDICATOR
            && !row.content.is_empty()
    });

    let Some(first) = qualifying.next() else {
        return Ok(String::new());
    };

    let extra = qualifying.count();
    if extra > 0 {
        return Err(TransformError::DuplicateInstanceId { count: extra + 1 });
    }

    Ok(first.content.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"leader":"L1","fields":[{"001":"X1"},{"999":{"ind1":"f","ind2":"f","subfields":[{"i":"inst-42"}]}}]}"#;

    fn row(line: i32, field: &str, ind: (&str, &str), ord: i32, sf: &str, content: &str) -> MarcRow {
        MarcRow {
            line,
            field: field.to_owned(),
            ind1: ind.0.to_owned(),
            ind2: ind.1.to_owned(),
            ord,
            sf: sf.to_owned(),
            content: content.to_owned(),
        }
    }

    #[test]
    fn current_record_emits_leader_control_and_data_rows() {
        let output = transform(SAMPLE, "ACTUAL").unwrap();

        assert_eq!(output.instance_id, "inst-42");
        assert_eq!(
            output.rows,
            vec![
                row(1, "000", ("", ""), 1, "", "L1"),
                row(2, "001", ("", ""), 1, "", "X1"),
                row(3, "999", ("f", "f"), 1, "i", "inst-42"),
            ]
        );
    }

    #[test]
    fn non_current_record_yields_no_rows_but_keeps_identifier() {
        let output = transform(SAMPLE, "WITHDRAWN").unwrap();

        assert!(output.rows.is_empty());
        assert_eq!(output.instance_id, "inst-42");
    }

    #[test]
    fn record_without_instance_identifier_yields_no_rows() {
        let content = r#"{"leader":"L","fields":[{"001":"X"},{"245":{"ind1":"1","ind2":"0","subfields":[{"a":"Title"}]}}]}"#;
        let output = transform(content, "ACTUAL").unwrap();

        assert!(output.rows.is_empty());
        assert_eq!(output.instance_id, "");
    }

    #[test]
    fn ord_counts_per_field_and_line_is_global() {
        let content = r#"{"leader":"L","fields":[
            {"650":{"ind1":" ","ind2":"0","subfields":[{"a":"Cats"},{"x":"History"}]}},
            {"500":{"ind1":" ","ind2":" ","subfields":[{"a":"Note"}]}},
            {"650":{"ind1":" ","ind2":"0","subfields":[{"a":"Dogs"}]}},
            {"999":{"ind1":"f","ind2":"f","subfields":[{"i":"inst-1"},{"s":"srs-1"}]}}
        ]}"#;
        let output = transform(content, "ACTUAL").unwrap();

        let summary: Vec<_> = output
            .rows
            .iter()
            .map(|r| (r.line, r.field.as_str(), r.ord, r.sf.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, "650", 1, "a"),
                (2, "650", 1, "x"),
                (3, "500", 1, "a"),
                (4, "650", 2, "a"),
                (5, "999", 1, "i"),
                (6, "999", 1, "s"),
            ]
        );
    }

    #[test]
    fn synthetic_leader_row_shares_ord_with_each_001() {
        let content = r#"{"leader":"L","fields":[{"001":"A"},{"001":"B"},{"999":{"ind1":"f","ind2":"f","subfields":[{"i":"x"}]}}]}"#;
        let output = transform(content, "ACTUAL").unwrap();

        let summary: Vec<_> = output
            .rows
            .iter()
            .map(|r| (r.field.as_str(), r.ord, r.content.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("000", 1, "L"),
                ("001", 1, "A"),
                ("000", 2, "L"),
                ("001", 2, "B"),
                ("999", 1, "x"),
            ]
        );
    }

    #[test]
    fn duplicate_instance_identifier_is_rejected() {
        let content = r#"{"leader":"L","fields":[
            {"999":{"ind1":"f","ind2":"f","subfields":[{"i":"a"}]}},
            {"999":{"ind1":"f","ind2":"f","subfields":[{"i":"b"}]}}
        ]}"#;

        assert_eq!(
            transform(content, "ACTUAL"),
            Err(TransformError::DuplicateInstanceId { count: 2 })
        );
    }

    #[test]
    fn non_qualifying_999_rows_are_ignored() {
        let content = r#"{"leader":"L","fields":[
            {"999":{"ind1":" ","ind2":" ","subfields":[{"i":"local"}]}},
            {"999":{"ind1":"f","ind2":"f","subfields":[{"i":""}]}},
            {"999":{"ind1":"f","ind2":"f","subfields":[{"i":"inst-7"}]}}
        ]}"#;
        let output = transform(content, "ACTUAL").unwrap();

        assert_eq!(output.instance_id, "inst-7");
        assert_eq!(output.rows.len(), 3);
    }

    #[test]
    fn structural_problems_reject_the_record() {
        let cases = [
            ("not json", TransformError::InvalidJson(String::new())),
            ("[]", TransformError::NotAnObject),
            (r#"{"fields":[]}"#, TransformError::MissingLeader),
            (r#"{"leader":"L"}"#, TransformError::MissingFields),
            (
                r#"{"leader":"L","fields":[{"001":"a","003":"b"}]}"#,
                TransformError::MalformedFieldEntry { index: 0 },
            ),
            (
                r#"{"leader":"L","fields":[{"008":12}]}"#,
                TransformError::InvalidFieldValue {
                    field: "008".to_owned(),
                },
            ),
            (
                r#"{"leader":"L","fields":[{"245":{"ind2":"0","subfields":[]}}]}"#,
                TransformError::MissingIndicator {
                    field: "245".to_owned(),
                    name: "ind1",
                },
            ),
            (
                r#"{"leader":"L","fields":[{"245":{"ind1":"1","ind2":"0"}}]}"#,
                TransformError::MissingSubfields {
                    field: "245".to_owned(),
                },
            ),
            (
                r#"{"leader":"L","fields":[{"245":{"ind1":"1","ind2":"0","subfields":[{"a":1}]}}]}"#,
                TransformError::MalformedSubfield {
                    field: "245".to_owned(),
                    index: 0,
                },
            ),
        ];

        for (content, expected) in cases {
            let err = transform(content, "ACTUAL").unwrap_err();
            match (&err, &expected) {
                (TransformError::InvalidJson(_), TransformError::InvalidJson(_)) => {}
                _ => assert_eq!(err, expected, "content: {content}"),
            }
        }
    }

    #[test]
    fn projection_attaches_record_identity() {
        let record = SourceRecord {
            id: "0b6c1f0e-3a4d-4c1b-8e2f-5a6b7c8d9e0f".to_owned(),
            matched_id: "not-a-uuid".to_owned(),
            external_hrid: "in001".to_owned(),
            state: "ACTUAL".to_owned(),
            content: r#"{"leader":"L","fields":[{"999":{"ind1":"f","ind2":"f","subfields":[{"i":"1d2e3f40-5a6b-4c7d-8e9f-0a1b2c3d4e5f"}]}}]}"#.to_owned(),
            digest: String::new(),
        };

        let projection = project_record(&record).unwrap();

        assert_eq!(projection.rows.len(), 1);
        let row = &projection.rows[0];
        assert_eq!(row.srs_id.to_string(), record.id);
        assert!(row.matched_id.is_nil());
        assert_eq!(row.instance_id.to_string(), projection.instance_id);
        assert_eq!(row.instance_hrid, "in001");
    }
}
