use marct_postgres::test_utils::PgDatabase;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::test_utils::database::TEST_DATABASE_SCHEMA;
use crate::transform::CURRENT_STATE;

/// A source record as inserted into the test relations.
#[derive(Debug, Clone)]
pub struct TestRecord {
    pub id: Uuid,
    pub matched_id: Uuid,
    pub hrid: String,
    pub state: String,
    pub content: Value,
}

impl TestRecord {
    /// A current record with a title and an instance identifier.
    pub fn new(hrid: &str, title: &str) -> TestRecord {
        let id = Uuid::new_v4();

        TestRecord {
            id,
            matched_id: id,
            hrid: hrid.to_owned(),
            state: CURRENT_STATE.to_owned(),
            content: marc_record(hrid, title, Uuid::new_v4()),
        }
    }

    pub fn with_state(mut self, state: &str) -> TestRecord {
        self.state = state.to_owned();
        self
    }
}

/// A small MARC record: leader, `001`, a `245 $a` title and a `999 ff $i` instance id.
///
/// Flattens to five rows: `000`, `001`, `245 $a`, `245 $b` and `999 $i`.
pub fn marc_record(hrid: &str, title: &str, instance_id: Uuid) -> Value {
    json!({
        "leader": "00000nam a2200000 a 4500",
        "fields": [
            { "001": hrid },
            { "245": {
                "ind1": "1",
                "ind2": "0",
                "subfields": [ { "a": title }, { "b": "a subtitle" } ]
            } },
            { "999": {
                "ind1": "f",
                "ind2": "f",
                "subfields": [ { "i": instance_id.to_string() } ]
            } }
        ]
    })
}

/// Number of projection rows [`marc_record`] flattens to.
pub const MARC_RECORD_ROWS: usize = 5;

pub async fn insert_record(database: &PgDatabase, record: &TestRecord) {
    let client = database.client();

    client
        .execute(
            &format!(
                "insert into {TEST_DATABASE_SCHEMA}.records (id, matched_id, external_hrid, state) \
                 values ($1, $2, $3, $4)"
            ),
            &[&record.id, &record.matched_id, &record.hrid, &record.state],
        )
        .await
        .expect("Failed to insert test record");
    client
        .execute(
            &format!("insert into {TEST_DATABASE_SCHEMA}.marc_records (id, content) values ($1, $2)"),
            &[&record.id, &record.content],
        )
        .await
        .expect("Failed to insert test record content");
}

pub async fn update_content(database: &PgDatabase, id: Uuid, content: &Value) {
    database
        .client()
        .execute(
            &format!("update {TEST_DATABASE_SCHEMA}.marc_records set content = $2 where id = $1"),
            &[&id, content],
        )
        .await
        .expect("Failed to update test record content");
}

pub async fn update_state(database: &PgDatabase, id: Uuid, state: &str) {
    database
        .client()
        .execute(
            &format!("update {TEST_DATABASE_SCHEMA}.records set state = $2 where id = $1"),
            &[&id, &state],
        )
        .await
        .expect("Failed to update test record state");
}

pub async fn delete_record(database: &PgDatabase, id: Uuid) {
    database
        .run_sql(&format!(
            "delete from {TEST_DATABASE_SCHEMA}.marc_records where id = '{id}';
             delete from {TEST_DATABASE_SCHEMA}.records where id = '{id}';"
        ))
        .await;
}

/// A projection row as read back from the target table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StoredRow {
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

/// Every row of `table` in the test schema, ordered by record and line.
pub async fn projection_rows(database: &PgDatabase, table: &str) -> Vec<StoredRow> {
    database
        .client()
        .query(
            &format!(
                "select srs_id, line, matched_id, instance_hrid, instance_id, field, ind1, ind2, \
                 ord, sf, content from {TEST_DATABASE_SCHEMA}.{table} order by srs_id, line"
            ),
            &[],
        )
        .await
        .expect("Failed to read projection rows")
        .into_iter()
        .map(|row| StoredRow {
            srs_id: row.get(0),
            line: row.get(1),
            matched_id: row.get(2),
            instance_hrid: row.get(3),
            instance_id: row.get(4),
            field: row.get(5),
            ind1: row.get(6),
            ind2: row.get(7),
            ord: row.get(8),
            sf: row.get(9),
            content: row.get(10),
        })
        .collect()
}

/// `(id, cksum)` pairs of the snapshot of `table`, ordered by id.
pub async fn checksum_entries(database: &PgDatabase, table: &str) -> Vec<(Uuid, String)> {
    database
        .client()
        .query(
            &format!("select id, cksum from {TEST_DATABASE_SCHEMA}.{table}__cksum order by id"),
            &[],
        )
        .await
        .expect("Failed to read checksum entries")
        .into_iter()
        .map(|row| (row.get(0), row.get(1)))
        .collect()
}

pub async fn table_exists(database: &PgDatabase, table: &str) -> bool {
    database
        .client()
        .query_one(
            "select to_regclass($1) is not null",
            &[&format!("{TEST_DATABASE_SCHEMA}.{table}")],
        )
        .await
        .expect("Failed to look up table")
        .get(0)
}

pub async fn set_snapshot_version(database: &PgDatabase, table: &str, version: i32) {
    database
        .run_sql(&format!(
            "update {TEST_DATABASE_SCHEMA}.{table}__metadata set version = {version}"
        ))
        .await;
}
