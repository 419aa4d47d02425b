use bulk_loader::load::{CheckpointStore, RegistrySnapshot};
use bulk_loader::test_support::MemoryDatabase;
use bulk_loader::{BulkLoader, Key, LoadError, LoaderConfig, TableConfig, Value};
use std::time::Duration;

fn row(values: &[&str]) -> Vec<Value> {
    values.iter().map(|v| Value::text(*v)).collect()
}

fn users() -> TableConfig {
    TableConfig::new("users", ["user_code", "name"])
        .with_rows(vec![row(&["user001", "Ada"]), row(&["user002", "Grace"])])
        .publish_keys("users")
}

fn orders() -> TableConfig {
    TableConfig::new("orders", ["order_code", "user_id", "amount"])
        .with_rows(vec![
            vec!["o1".into(), "user001".into(), 19.99.into()],
            vec!["o2".into(), "user002".into(), 5.0.into()],
            vec!["o3".into(), "user001".into(), 42.into()],
        ])
        .depends_on("user_id", "users")
        .publish_keys("orders")
}

fn order_items() -> TableConfig {
    TableConfig::new("order_items", ["item_code", "order_id", "quantity"])
        .with_rows(vec![
            vec!["item001".into(), "o1".into(), 1.into()],
            vec!["item002".into(), "o1".into(), 2.into()],
            vec!["item003".into(), "o2".into(), 1.into()],
            vec!["item004".into(), "o3".into(), 5.into()],
        ])
        .depends_on("order_id", "orders")
}

fn scenario() -> Vec<TableConfig> {
    vec![order_items(), users(), orders()]
}

fn config() -> LoaderConfig {
    bulk_loader::init_logger();
    LoaderConfig::new().with_batch_size(2)
}

fn ids(values: Vec<(i64, Value)>) -> Vec<Value> {
    values.into_iter().map(|(_, value)| value).collect()
}

#[tokio::test]
async fn test_three_table_scenario() {
    let db = MemoryDatabase::new();
    let loader = BulkLoader::new(db.clone(), config());

    let report = loader.run(scenario()).await.unwrap();

    let order: Vec<&str> = report.tables.iter().map(|t| t.table.as_str()).collect();
    assert_eq!(order, vec!["users", "orders", "order_items"]);
    assert_eq!(report.rows_for("users"), 2);
    assert_eq!(report.rows_for("orders"), 3);
    assert_eq!(report.rows_for("order_items"), 4);
    assert_eq!(report.rows_inserted, 9);

    assert_eq!(
        report.id_mapping.entries("users"),
        &[
            (Key::from("user001"), Key::Int(1)),
            (Key::from("user002"), Key::Int(2)),
        ]
    );
    assert_eq!(
        ids(db.column("orders", "user_id")),
        vec![Value::Integer(1), Value::Integer(2), Value::Integer(1)]
    );
    assert_eq!(
        ids(db.column("order_items", "order_id")),
        vec![
            Value::Integer(1),
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(3)
        ]
    );
}

#[tokio::test]
async fn test_mutual_dependency_fails_before_connecting() {
    let db = MemoryDatabase::new();
    let loader = BulkLoader::new(db.clone(), config());

    let tables = vec![
        TableConfig::new("a", ["code", "b_code"])
            .depends_on("b_code", "b")
            .publish_keys("a"),
        TableConfig::new("b", ["code", "a_code"])
            .depends_on("a_code", "a")
            .publish_keys("b"),
    ];
    let failure = loader.run(tables).await.unwrap_err();

    match failure.error {
        LoadError::DependencyCycle { tables } => assert_eq!(tables, vec!["a", "b"]),
        other => panic!("expected a cycle, got {other}"),
    }
    assert_eq!(db.connections_opened(), 0);
}

#[tokio::test]
async fn test_concurrent_batches_cover_every_row() {
    let db = MemoryDatabase::new();
    let loader = BulkLoader::new(
        db.clone(),
        LoaderConfig::new().with_batch_size(200).with_concurrency(4),
    );

    let rows = (0..500)
        .map(|i| vec![Value::text(format!("user{:03}", i)), Value::Integer(i)])
        .collect();
    let table = TableConfig::new("users", ["user_code", "score"])
        .with_rows(rows)
        .publish_keys("users");

    let report = loader.run(vec![table]).await.unwrap();

    assert_eq!(report.batches, 3);
    assert_eq!(report.rows_inserted, 500);
    let mut sizes = db.insert_batch_sizes("users");
    sizes.sort_unstable();
    assert_eq!(sizes, vec![100, 200, 200]);
    assert_eq!(report.id_mapping.entries("users").len(), 500);
    assert_eq!(db.connections_opened(), 4);
}

#[tokio::test]
async fn test_concurrent_failures_are_all_reported() {
    let db = MemoryDatabase::new().with_latency(Duration::from_millis(20));
    db.fail_on_value("users", 0, "u1");
    db.fail_on_value("users", 0, "u2");
    let loader = BulkLoader::new(
        db.clone(),
        LoaderConfig::new().with_batch_size(1).with_concurrency(4),
    );

    let table = TableConfig::new("users", ["user_code"])
        .with_rows((0..4).map(|i| vec![Value::text(format!("u{}", i))]).collect())
        .publish_keys("users");
    let failure = loader.run(vec![table]).await.unwrap_err();

    assert_eq!(failure.table.as_deref(), Some("users"));
    assert_eq!(failure.batch, Some(1));
    let failed: Vec<usize> = failure.batch_failures.iter().map(|f| f.batch).collect();
    assert_eq!(failed, vec![1, 2]);
    assert_eq!(failure.report.rows_for("users"), 2);
    assert_eq!(db.row_count("users"), 2);
}

#[tokio::test]
async fn test_missing_mapping_fails_before_insert() {
    let db = MemoryDatabase::new();
    let loader = BulkLoader::new(db.clone(), config());

    let mut bad_orders = orders();
    bad_orders.rows[2][1] = Value::text("user999");
    let failure = loader
        .run(vec![users(), bad_orders])
        .await
        .unwrap_err();

    match &failure.error {
        LoadError::MissingMapping { parent, key } => {
            assert_eq!(parent, "users");
            assert_eq!(key, &Key::from("user999"));
        }
        other => panic!("expected a missing mapping, got {other}"),
    }
    assert_eq!(failure.table.as_deref(), Some("orders"));
    assert_eq!(db.row_count("users"), 2);
    assert_eq!(db.insert_statements("orders"), 0);
}

#[tokio::test]
async fn test_optional_foreign_key_stays_null() {
    let db = MemoryDatabase::new();
    let loader = BulkLoader::new(db.clone(), config());

    let mut guest_orders = orders();
    guest_orders.rows[1][1] = Value::Null;
    loader.run(vec![users(), guest_orders]).await.unwrap();

    assert_eq!(
        ids(db.column("orders", "user_id")),
        vec![Value::Integer(1), Value::Null, Value::Integer(1)]
    );
}

#[tokio::test]
async fn test_resume_skips_completed_tables() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("insert_checkpoint.json");
    let db = MemoryDatabase::new();
    let loader = BulkLoader::new(db.clone(), config().resumable(&path));

    db.fail_on_value("order_items", 0, "item001");
    let failure = loader.run(scenario()).await.unwrap_err();
    assert_eq!(failure.table.as_deref(), Some("order_items"));

    let checkpoint = CheckpointStore::new(&path).try_load().unwrap().unwrap();
    assert_eq!(checkpoint.completed_table_count, 2);
    assert_eq!(db.insert_statements("users"), 1);
    assert_eq!(db.insert_statements("orders"), 2);

    db.clear_failures();
    let report = loader.run(scenario()).await.unwrap();

    assert_eq!(report.tables_skipped, 2);
    assert_eq!(report.rows_for("order_items"), 4);
    assert_eq!(db.insert_statements("users"), 1);
    assert_eq!(db.insert_statements("orders"), 2);
    assert_eq!(db.row_count("users"), 2);
    assert_eq!(db.row_count("orders"), 3);
    assert_eq!(
        ids(db.column("order_items", "order_id")),
        vec![
            Value::Integer(1),
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(3)
        ]
    );
    assert!(!path.exists());

    // Same registry as an uninterrupted run.
    let fresh = BulkLoader::new(MemoryDatabase::new(), config())
        .run(scenario())
        .await
        .unwrap();
    assert_eq!(report.id_mapping, fresh.id_mapping);
}

#[tokio::test]
async fn test_checkpoint_from_another_plan_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("insert_checkpoint.json");
    let db = MemoryDatabase::new();
    let loader = BulkLoader::new(db.clone(), config().resumable(&path));

    db.fail_on_value("orders", 0, "o1");
    loader.run(vec![users(), orders()]).await.unwrap_err();
    db.clear_failures();

    let report = loader.run(scenario()).await.unwrap();
    assert_eq!(report.tables_skipped, 0);
    assert_eq!(db.insert_statements("users"), 2);
}

#[tokio::test]
async fn test_session_restored_after_failure() {
    let db = MemoryDatabase::new();
    db.fail_on_value("orders", 0, "o3");
    let loader = BulkLoader::new(db.clone(), config().with_concurrency(2));

    let failure = loader.run(scenario()).await.unwrap_err();
    assert!(matches!(failure.error, LoadError::BatchExecution { .. }));

    for connection in 0..2 {
        assert_eq!(db.session_value(connection, "synchronous_commit").as_deref(), Some("on"));
        assert_eq!(
            db.session_value(connection, "session_replication_role").as_deref(),
            Some("origin")
        );
        assert_eq!(db.session_value(connection, "lock_timeout").as_deref(), Some("0"));
    }
}

#[tokio::test]
async fn test_session_failure_aborts_before_loading() {
    let db = MemoryDatabase::new();
    db.fail_session_variable(1, "synchronous_commit");
    let loader = BulkLoader::new(db.clone(), config().with_concurrency(2));

    let failure = loader.run(scenario()).await.unwrap_err();

    assert!(matches!(failure.error, LoadError::Session(_)));
    assert_eq!(db.row_count("users"), 0);
    assert_eq!(db.session_value(0, "session_replication_role").as_deref(), Some("origin"));
}

#[tokio::test]
async fn test_cancellation_stops_at_table_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("insert_checkpoint.json");
    let db = MemoryDatabase::new();
    let loader = BulkLoader::new(db.clone(), config().resumable(&path));
    db.cancel_on_insert("users", loader.cancellation_token());

    let failure = loader.run(scenario()).await.unwrap_err();

    assert!(failure.is_cancelled());
    assert_eq!(failure.table.as_deref(), Some("orders"));
    assert_eq!(failure.report.rows_for("users"), 2);
    assert_eq!(db.row_count("users"), 2);
    assert_eq!(db.row_count("orders"), 0);

    let checkpoint = CheckpointStore::new(&path).try_load().unwrap().unwrap();
    assert_eq!(checkpoint.completed_table_count, 1);
    assert_ne!(checkpoint.id_mapping, RegistrySnapshot::default());
}

#[tokio::test]
async fn test_resume_after_table_failed_part_way() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("insert_checkpoint.json");
    let db = MemoryDatabase::new();
    let loader = BulkLoader::new(db.clone(), config().resumable(&path));

    db.fail_on_value("orders", 0, "o3");
    let failure = loader.run(vec![users(), orders()]).await.unwrap_err();
    assert_eq!(failure.table.as_deref(), Some("orders"));
    assert_eq!(failure.batch, Some(1));
    assert_eq!(db.row_count("orders"), 2);
    let checkpoint = CheckpointStore::new(&path).try_load().unwrap().unwrap();
    assert_eq!(checkpoint.completed_table_count, 1);

    db.clear_failures();
    let report = loader.run(vec![users(), orders()]).await.unwrap();

    // The table restarts from its first row; rows of the failed attempt stay behind.
    assert_eq!(report.tables_skipped, 1);
    assert_eq!(report.rows_for("orders"), 3);
    assert_eq!(db.row_count("orders"), 5);
    assert_eq!(
        report.id_mapping.entries("orders"),
        &[
            (Key::from("o1"), Key::Int(3)),
            (Key::from("o2"), Key::Int(4)),
            (Key::from("o3"), Key::Int(5)),
        ]
    );
    assert_eq!(
        ids(db.column("orders", "user_id")),
        vec![
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(1)
        ]
    );
    assert!(!path.exists());
}

#[tokio::test]
async fn test_cancellation_under_concurrent_batches() {
    let db = MemoryDatabase::new();
    let loader = BulkLoader::new(db.clone(), config().with_batch_size(1).with_concurrency(2));
    db.cancel_on_insert("users", loader.cancellation_token());

    let table = TableConfig::new("users", ["user_code"])
        .with_rows((0..10).map(|i| vec![Value::text(format!("u{}", i))]).collect())
        .publish_keys("users");
    let failure = loader.run(vec![table]).await.unwrap_err();

    assert!(failure.is_cancelled());
    assert_eq!(failure.table.as_deref(), Some("users"));
    // Batches already running when the token fired still commit; no new batch starts.
    let committed = db.row_count("users");
    assert!((1..=2).contains(&committed), "committed {} rows", committed);
    assert_eq!(failure.report.rows_for("users"), committed as u64);
    assert_eq!(db.session_value(1, "synchronous_commit").as_deref(), Some("on"));
}

#[tokio::test]
async fn test_load_succeeds_when_a_session_setting_is_denied() {
    let db = MemoryDatabase::new();
    db.deny_session_variable("session_replication_role");
    let loader = BulkLoader::new(db.clone(), config().with_concurrency(2));

    let report = loader.run(scenario()).await.unwrap();

    assert_eq!(report.rows_inserted, 9);
    assert_eq!(db.session_value(0, "session_replication_role").as_deref(), Some("origin"));
    assert_eq!(db.session_value(0, "synchronous_commit").as_deref(), Some("on"));
}
