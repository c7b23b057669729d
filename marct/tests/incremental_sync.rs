#![cfg(feature = "test-utils")]

use std::time::Duration;

use marct::error::ErrorKind;
use marct::schema::ProjectionTables;
use marct::sync::{SyncOutcome, Synchronizer};
use marct::test_utils::database::{spawn_database, test_layout, test_sync_config};
use marct::test_utils::source::{
    MARC_RECORD_ROWS, StoredRow, TestRecord, checksum_entries, delete_record, insert_record,
    marc_record, projection_rows, set_snapshot_version, update_content, update_state,
};
use marct_config::shared::SyncConfig;
use marct_postgres::test_utils::PgDatabase;
use marct_telemetry::tracing::init_test_tracing;
use uuid::Uuid;

const TARGET: &str = "marctab";

fn synchronizer(database: &PgDatabase) -> Synchronizer {
    Synchronizer::new(database.config.clone(), &test_layout(), test_sync_config())
}

/// Seeds `count` records and builds the initial projection and snapshot.
async fn seeded(database: &PgDatabase, count: usize) -> Vec<TestRecord> {
    let mut records = Vec::with_capacity(count);
    for n in 0..count {
        let record = TestRecord::new(&format!("in{n:08}"), &format!("Title {n}"));
        insert_record(database, &record).await;
        records.push(record);
    }

    let outcome = synchronizer(database).run().await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Full(_)));

    records
}

/// Rebuilds into the same target and returns its rows, for comparison with an incremental run.
async fn rebuilt_rows(database: &PgDatabase) -> Vec<StoredRow> {
    let config = SyncConfig {
        force_full: true,
        ..test_sync_config()
    };
    Synchronizer::new(database.config.clone(), &test_layout(), config)
        .run()
        .await
        .unwrap();

    projection_rows(database, TARGET).await
}

#[tokio::test(flavor = "multi_thread")]
async fn unchanged_source_applies_nothing() {
    init_test_tracing();

    let database = spawn_database().await;
    seeded(&database, 3).await;
    let before = projection_rows(&database, TARGET).await;

    let SyncOutcome::Incremental(summary) = synchronizer(&database).run().await.unwrap() else {
        panic!("expected an incremental update");
    };

    assert_eq!(summary.added, 0);
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.changed, 0);
    assert_eq!(projection_rows(&database, TARGET).await, before);
}

#[tokio::test(flavor = "multi_thread")]
async fn incremental_update_matches_full_rebuild() {
    init_test_tracing();

    let database = spawn_database().await;
    let records = seeded(&database, 4).await;

    // One addition, one deletion and one content change.
    let added = TestRecord::new("in00000100", "Added title");
    insert_record(&database, &added).await;
    delete_record(&database, records[0].id).await;
    update_content(
        &database,
        records[1].id,
        &marc_record("in00000001", "Revised title", Uuid::new_v4()),
    )
    .await;

    let SyncOutcome::Incremental(summary) = synchronizer(&database).run().await.unwrap() else {
        panic!("expected an incremental update");
    };
    assert_eq!(summary.added, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.changed, 1);
    assert_eq!(summary.retired, 0);
    assert_eq!(summary.rows_written, 2 * MARC_RECORD_ROWS as u64);

    let incremental_rows = projection_rows(&database, TARGET).await;
    let incremental_entries = checksum_entries(&database, TARGET).await;
    assert_eq!(incremental_rows.len(), 4 * MARC_RECORD_ROWS);
    assert!(
        incremental_rows
            .iter()
            .any(|row| row.srs_id == records[1].id && row.content == "Revised title")
    );

    assert_eq!(rebuilt_rows(&database).await, incremental_rows);
    assert_eq!(checksum_entries(&database, TARGET).await, incremental_entries);
}

#[tokio::test(flavor = "multi_thread")]
async fn deleted_records_leave_no_rows_or_entries() {
    init_test_tracing();

    let database = spawn_database().await;
    let records = seeded(&database, 3).await;

    for record in &records[..2] {
        delete_record(&database, record.id).await;
    }

    let SyncOutcome::Incremental(summary) = synchronizer(&database).run().await.unwrap() else {
        panic!("expected an incremental update");
    };
    assert_eq!(summary.deleted, 2);

    let rows = projection_rows(&database, TARGET).await;
    assert_eq!(rows.len(), MARC_RECORD_ROWS);
    assert!(rows.iter().all(|row| row.srs_id == records[2].id));

    let entries = checksum_entries(&database, TARGET).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, records[2].id);
}

#[tokio::test(flavor = "multi_thread")]
async fn record_leaving_current_state_is_retired() {
    init_test_tracing();

    let database = spawn_database().await;
    let records = seeded(&database, 2).await;

    update_state(&database, records[0].id, "OLD").await;

    let SyncOutcome::Incremental(summary) = synchronizer(&database).run().await.unwrap() else {
        panic!("expected an incremental update");
    };
    assert_eq!(summary.changed, 0);
    assert_eq!(summary.retired, 1);

    let rows = projection_rows(&database, TARGET).await;
    assert!(rows.iter().all(|row| row.srs_id == records[1].id));
    assert!(
        checksum_entries(&database, TARGET)
            .await
            .iter()
            .all(|(id, _)| *id != records[0].id)
    );

    // A later run must not bring it back.
    let SyncOutcome::Incremental(summary) = synchronizer(&database).run().await.unwrap() else {
        panic!("expected an incremental update");
    };
    assert_eq!(summary.added, 0);
    assert_eq!(projection_rows(&database, TARGET).await, rows);
}

#[tokio::test(flavor = "multi_thread")]
async fn added_record_with_new_field_gets_partitions() {
    init_test_tracing();

    let database = spawn_database().await;
    seeded(&database, 1).await;

    let mut record = TestRecord::new("in00000009", "With a note");
    record.content["fields"]
        .as_array_mut()
        .unwrap()
        .push(serde_json::json!({ "500": { "ind1": " ", "ind2": " ", "subfields": [ { "A": "Note" } ] } }));
    insert_record(&database, &record).await;

    let SyncOutcome::Incremental(summary) = synchronizer(&database).run().await.unwrap() else {
        panic!("expected an incremental update");
    };
    assert_eq!(summary.added, 1);

    let note: Vec<_> = projection_rows(&database, TARGET)
        .await
        .into_iter()
        .filter(|row| row.field == "500")
        .collect();
    assert_eq!(note.len(), 1);
    assert_eq!(note[0].sf, "A");

    let partition_rows: i64 = database
        .client()
        .query_one("select count(*) from test.marctab_500_aa", &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(partition_rows, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn changed_records_gaining_new_subfields_stay_incremental() {
    init_test_tracing();

    let database = spawn_database().await;
    let records = seeded(&database, 2).await;

    // Each change needs a partition the projection does not have yet, and the second record is
    // inspected while the writer still holds the first one's partition uncommitted.
    for (record, code) in records.iter().zip(["z", "y"]) {
        let mut content = marc_record(&record.hrid, "Annotated", Uuid::new_v4());
        content["fields"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!({ "500": { "ind1": " ", "ind2": " ", "subfields": [ { code: "Note" } ] } }));
        update_content(&database, record.id, &content).await;
    }

    let outcome = synchronizer(&database).run().await.unwrap();
    let SyncOutcome::Incremental(summary) = &outcome else {
        panic!("expected an incremental update, got {outcome:?}");
    };
    assert_eq!(summary.changed, 2);
    assert_eq!(summary.retired, 0);

    let incremental_rows = projection_rows(&database, TARGET).await;
    assert_eq!(incremental_rows.len(), 2 * (MARC_RECORD_ROWS + 1));
    for partition in ["test.marctab_500_z", "test.marctab_500_y"] {
        let rows: i64 = database
            .client()
            .query_one(&format!("select count(*) from {partition}"), &[])
            .await
            .unwrap()
            .get(0);
        assert_eq!(rows, 1, "{partition}");
    }

    assert_eq!(rebuilt_rows(&database).await, incremental_rows);
}

#[tokio::test(flavor = "multi_thread")]
async fn incremental_update_past_its_deadline_falls_back_to_full_rebuild() {
    init_test_tracing();

    let database = spawn_database().await;
    seeded(&database, 2).await;

    // Listing additions reads the checksum relation, which stays locked past the deadline.
    let locker = database.duplicate().await;
    locker
        .run_sql("begin; lock table test.marctab__cksum in access exclusive mode")
        .await;
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(4)).await;
        locker.run_sql("commit").await;
        locker
    });

    let config = SyncConfig {
        incremental_deadline_secs: 1,
        ..test_sync_config()
    };
    let outcome = Synchronizer::new(database.config.clone(), &test_layout(), config)
        .run()
        .await
        .unwrap();
    let SyncOutcome::FullAfterFallback {
        summary,
        incremental_error,
    } = &outcome
    else {
        panic!("expected a fallback rebuild, got {outcome:?}");
    };

    assert_eq!(incremental_error.kind(), ErrorKind::IncrementalTimeout);
    assert_eq!(summary.checksum_entries, 2);
    assert_eq!(checksum_entries(&database, TARGET).await.len(), 2);
    assert_eq!(
        projection_rows(&database, TARGET).await.len(),
        2 * MARC_RECORD_ROWS
    );

    release.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn digest_distinguishes_text_shifted_between_attributes() {
    init_test_tracing();

    let database = spawn_database().await;
    let first = TestRecord::new("in1", "Title").with_state("ACTUAL");
    let second = TestRecord {
        id: Uuid::new_v4(),
        hrid: "in1A".to_owned(),
        state: "CTUAL".to_owned(),
        ..first.clone()
    };
    insert_record(&database, &first).await;
    insert_record(&database, &second).await;

    let digest = ProjectionTables::new(&test_layout()).digest_expression();
    let digests: Vec<String> = database
        .client()
        .query(
            &format!(
                "select {digest} from test.records r join test.marc_records c on c.id = r.id \
                 where r.id = any($1) order by r.external_hrid"
            ),
            &[&vec![first.id, second.id]],
        )
        .await
        .unwrap()
        .iter()
        .map(|row| row.get(0))
        .collect();

    assert_eq!(digests.len(), 2);
    assert_ne!(digests[0], digests[1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_version_mismatch_forces_full_rebuild() {
    init_test_tracing();

    let database = spawn_database().await;
    seeded(&database, 2).await;
    set_snapshot_version(&database, TARGET, 0).await;

    let synchronizer = synchronizer(&database);
    assert!(!synchronizer.incremental_available().await.unwrap());

    let outcome = synchronizer.run().await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Full(_)));
    assert!(synchronizer.incremental_available().await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_snapshot_forces_full_rebuild() {
    init_test_tracing();

    let database = spawn_database().await;
    seeded(&database, 2).await;
    database.run_sql("drop table test.marctab__cksum").await;

    let outcome = synchronizer(&database).run().await.unwrap();
    let SyncOutcome::Full(summary) = &outcome else {
        panic!("expected a full rebuild, got {outcome:?}");
    };
    assert_eq!(summary.checksum_entries, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_incremental_update_falls_back_to_full_rebuild() {
    init_test_tracing();

    let database = spawn_database().await;
    let records = seeded(&database, 2).await;

    // The incremental writer cannot insert into the projection once its parent is replaced by
    // a plain table with a missing column, while a full rebuild recreates it from scratch.
    database
        .run_sql(
            "drop table test.marctab;
             create table test.marctab (srs_id uuid not null)",
        )
        .await;
    update_content(
        &database,
        records[0].id,
        &marc_record("in00000000", "Changed", Uuid::new_v4()),
    )
    .await;

    let outcome = synchronizer(&database).run().await.unwrap();
    let SyncOutcome::FullAfterFallback {
        summary,
        incremental_error,
    } = &outcome
    else {
        panic!("expected a fallback rebuild, got {outcome:?}");
    };

    assert_ne!(incremental_error.kind(), ErrorKind::IncrementalTimeout);
    assert_eq!(summary.checksum_entries, 2);
    assert_eq!(
        projection_rows(&database, TARGET).await.len(),
        2 * MARC_RECORD_ROWS
    );
}
