#![cfg(feature = "test-utils")]

use marct::checksum::SCHEMA_VERSION;
use marct::sync::{SyncOutcome, Synchronizer};
use marct::test_utils::database::{spawn_database, test_layout, test_sync_config};
use marct::test_utils::source::{
    MARC_RECORD_ROWS, TestRecord, checksum_entries, delete_record, insert_record,
    projection_rows, table_exists,
};
use marct_config::shared::SyncConfig;
use marct_telemetry::tracing::init_test_tracing;

const TARGET: &str = "marctab";

fn full_config() -> SyncConfig {
    SyncConfig {
        force_full: true,
        ..test_sync_config()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn full_rebuild_projects_only_current_records() {
    init_test_tracing();

    let database = spawn_database().await;
    let first = TestRecord::new("in00000001", "First title");
    let second = TestRecord::new("in00000002", "Second title");
    let retired = TestRecord::new("in00000003", "Retired title").with_state("OLD");
    for record in [&first, &second, &retired] {
        insert_record(&database, record).await;
    }

    let synchronizer = Synchronizer::new(database.config.clone(), &test_layout(), test_sync_config());
    let outcome = synchronizer.run().await.unwrap();

    let SyncOutcome::Full(summary) = &outcome else {
        panic!("expected a full rebuild without a snapshot, got {outcome:?}");
    };
    assert_eq!(summary.records_read, 2);
    assert_eq!(summary.rows_loaded, 2 * MARC_RECORD_ROWS as u64);
    assert_eq!(summary.checksum_entries, 2);

    let rows = projection_rows(&database, TARGET).await;
    assert_eq!(rows.len(), 2 * MARC_RECORD_ROWS);
    assert!(rows.iter().all(|row| row.srs_id != retired.id));

    let first_rows: Vec<_> = rows.iter().filter(|row| row.srs_id == first.id).collect();
    let fields: Vec<_> = first_rows
        .iter()
        .map(|row| (row.line, row.field.as_str(), row.sf.as_str()))
        .collect();
    assert_eq!(
        fields,
        vec![
            (1, "000", ""),
            (2, "001", ""),
            (3, "245", "a"),
            (4, "245", "b"),
            (5, "999", "i"),
        ]
    );
    assert!(first_rows.iter().all(|row| row.instance_hrid == "in00000001"));
    assert!(first_rows.iter().all(|row| row.matched_id == first.id));

    let mut snapshot_ids: Vec<_> = checksum_entries(&database, TARGET)
        .await
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    let mut expected_ids = vec![first.id, second.id];
    snapshot_ids.sort();
    expected_ids.sort();
    assert_eq!(snapshot_ids, expected_ids);

    assert!(table_exists(&database, "marctab_245").await);
    assert!(table_exists(&database, "marctab_245_a").await);
    assert!(!table_exists(&database, "marctab__tmp").await);

    let version: i32 = database
        .client()
        .query_one("select version from test.marctab__metadata", &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(version, SCHEMA_VERSION);
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_full_rebuilds_produce_the_same_projection() {
    init_test_tracing();

    let database = spawn_database().await;
    for n in 0..5 {
        insert_record(
            &database,
            &TestRecord::new(&format!("in0000000{n}"), &format!("Title {n}")),
        )
        .await;
    }

    let synchronizer = Synchronizer::new(database.config.clone(), &test_layout(), full_config());

    synchronizer.run().await.unwrap();
    let first_rows = projection_rows(&database, TARGET).await;
    let first_entries = checksum_entries(&database, TARGET).await;

    synchronizer.run().await.unwrap();
    assert_eq!(projection_rows(&database, TARGET).await, first_rows);
    assert_eq!(checksum_entries(&database, TARGET).await, first_entries);
    assert_eq!(first_rows.len(), 5 * MARC_RECORD_ROWS);
}

#[tokio::test(flavor = "multi_thread")]
async fn unparseable_records_are_skipped() {
    init_test_tracing();

    let database = spawn_database().await;
    let valid = TestRecord::new("in00000001", "Valid");
    let mut broken = TestRecord::new("in00000002", "Broken");
    broken.content = serde_json::json!({ "leader": "00000nam", "fields": "not an array" });
    insert_record(&database, &valid).await;
    insert_record(&database, &broken).await;

    let synchronizer = Synchronizer::new(database.config.clone(), &test_layout(), full_config());
    let SyncOutcome::Full(summary) = synchronizer.run().await.unwrap() else {
        panic!("expected a full rebuild");
    };

    assert_eq!(summary.records_read, 2);
    assert_eq!(summary.records_skipped, 1);

    let rows = projection_rows(&database, TARGET).await;
    assert_eq!(rows.len(), MARC_RECORD_ROWS);
    assert!(rows.iter().all(|row| row.srs_id == valid.id));
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_source_leaves_empty_projection_without_snapshot() {
    init_test_tracing();

    let database = spawn_database().await;
    let record = TestRecord::new("in00000001", "Only title");
    insert_record(&database, &record).await;

    let synchronizer = Synchronizer::new(database.config.clone(), &test_layout(), full_config());
    synchronizer.run().await.unwrap();
    assert!(table_exists(&database, "marctab__cksum").await);

    delete_record(&database, record.id).await;
    let SyncOutcome::Full(summary) = synchronizer.run().await.unwrap() else {
        panic!("expected a full rebuild");
    };

    assert_eq!(summary.rows_loaded, 0);
    assert_eq!(summary.checksum_entries, 0);
    assert!(table_exists(&database, TARGET).await);
    assert!(projection_rows(&database, TARGET).await.is_empty());
    assert!(!table_exists(&database, "marctab__cksum").await);
    assert!(!table_exists(&database, "marctab__metadata").await);
    assert!(!synchronizer.incremental_available().await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn grants_read_access_to_consumer_accounts() {
    init_test_tracing();

    let database = spawn_database().await;
    let role = format!("marct_reader_{}", uuid::Uuid::new_v4().simple());
    database
        .run_sql(&format!("create role {role} nologin"))
        .await;
    insert_record(&database, &TestRecord::new("in00000001", "Title")).await;

    let config = SyncConfig {
        consumer_accounts: vec![role.clone()],
        ..full_config()
    };
    Synchronizer::new(database.config.clone(), &test_layout(), config)
        .run()
        .await
        .unwrap();

    let granted: bool = database
        .client()
        .query_one(
            "select has_table_privilege($1, 'test.marctab', 'select')",
            &[&role],
        )
        .await
        .unwrap()
        .get(0);
    assert!(granted);

    database.run_sql(&format!("drop owned by {role}; drop role {role}")).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_grant_leaves_no_snapshot_of_the_replaced_projection() {
    init_test_tracing();

    let database = spawn_database().await;
    insert_record(&database, &TestRecord::new("in00000001", "First title")).await;
    Synchronizer::new(database.config.clone(), &test_layout(), full_config())
        .run()
        .await
        .unwrap();
    assert!(table_exists(&database, "marctab__cksum").await);

    let added = TestRecord::new("in00000002", "Second title");
    insert_record(&database, &added).await;

    let config = SyncConfig {
        consumer_accounts: vec!["marct_missing_role".to_owned()],
        ..full_config()
    };
    let result = Synchronizer::new(database.config.clone(), &test_layout(), config)
        .run()
        .await;
    assert!(result.is_err());

    // The new projection is already in place, so the old entries would describe the wrong rows.
    assert!(!table_exists(&database, "marctab__cksum").await);
    assert!(!table_exists(&database, "marctab__metadata").await);

    let outcome = Synchronizer::new(database.config.clone(), &test_layout(), test_sync_config())
        .run()
        .await
        .unwrap();
    let SyncOutcome::Full(summary) = &outcome else {
        panic!("expected a full rebuild, got {outcome:?}");
    };
    assert_eq!(summary.checksum_entries, 2);

    let rows = projection_rows(&database, TARGET).await;
    assert_eq!(rows.iter().filter(|row| row.srs_id == added.id).count(), MARC_RECORD_ROWS);
    assert_eq!(rows.len(), 2 * MARC_RECORD_ROWS);
}
