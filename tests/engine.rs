use hypercubedb::storage::partitioned_table::PartitionedTable;
use hypercubedb::{Config, FieldValue, HypercubeDb, Outcome, Record, Rejection, TableSpec};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::tempdir;

async fn open(dir: &Path) -> HypercubeDb {
    HypercubeDb::open(Config::with_data_dir(dir)).await.unwrap()
}

/// Engine with database `d` selected and table `t` keyed by `id` over 4 partitions.
async fn open_with_table(dir: &Path) -> HypercubeDb {
    let db = open(dir).await;
    assert!(db.create_database("d").is_applied());
    assert!(db.use_database("d").is_applied());
    assert!(db.create_table("t", TableSpec::keyed("id", 4)).is_applied());
    db
}

fn rec(value: Value) -> Record {
    Record::from_json(&value).unwrap()
}

fn select(db: &HypercubeDb, table: &str, predicate: Value) -> Vec<Record> {
    db.select_data(table, &predicate, &["*"])
        .unwrap()
        .applied()
        .unwrap()
        .data
}

/// Every record as a sorted field -> text map, the rows sorted too. Values
/// reload as text, so this is the shape compared across a save.
fn as_text_rows(records: &[Record]) -> Vec<BTreeMap<String, String>> {
    let mut rows: Vec<BTreeMap<String, String>> = records
        .iter()
        .map(|r| r.iter().map(|(field, value)| (field.clone(), value.to_text())).collect())
        .collect();
    rows.sort();
    rows
}

fn texts(records: &[Record], field: &str) -> Vec<String> {
    let mut values: Vec<String> = records
        .iter()
        .filter_map(|r| r.get(field).map(FieldValue::to_text))
        .collect();
    values.sort();
    values
}

#[tokio::test]
async fn select_and_delete_by_predicate() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path()).await;
    assert!(db.insert_data("t", &json!({"id": 1, "a": 5})).is_applied());
    assert!(db.insert_data("t", &json!({"id": 2, "a": 7})).is_applied());

    let rows = select(&db, "t", json!({"a": {"_op": ">", "_value": 6}}));
    assert_eq!(rows, vec![rec(json!({"id": 2, "a": 7}))]);

    let by_key = json!({"id": {"_op": "=", "_value": 1}});
    assert_eq!(db.delete_data("t", &by_key).unwrap(), Outcome::Applied(1));
    assert_eq!(db.delete_data("t", &by_key).unwrap(), Outcome::Applied(0));
    assert_eq!(select(&db, "t", json!({})), vec![rec(json!({"id": 2, "a": 7}))]);
    db.close().await.unwrap();
}

#[tokio::test]
async fn text_falls_back_to_string_comparison() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path()).await;
    db.insert_data("t", &json!({"id": 1, "s": "abc"})).applied().unwrap();

    assert!(select(&db, "t", json!({"s": {"_op": ">", "_value": "abd"}})).is_empty());
    assert_eq!(texts(&select(&db, "t", json!({"s": {"_op": "<", "_value": "abd"}})), "id"), vec!["1"]);
    assert_eq!(texts(&select(&db, "t", json!({"s": {"_op": ">=", "_value": "abc"}})), "id"), vec!["1"]);
    db.close().await.unwrap();
}

#[tokio::test]
async fn commands_need_a_selected_database_and_table() {
    let dir = tempdir().unwrap();
    let db = open(dir.path()).await;
    assert_eq!(
        db.insert_data("t", &json!({"id": 1})),
        Outcome::Skipped(Rejection::NoDatabaseSelected)
    );
    assert_eq!(
        db.use_database("missing"),
        Outcome::Skipped(Rejection::DatabaseNotFound("missing".into()))
    );

    db.create_database("d").applied().unwrap();
    db.use_database("d").applied().unwrap();
    assert_eq!(
        db.insert_data("t", &json!({"id": 1})),
        Outcome::Skipped(Rejection::TableNotFound("t".into()))
    );
    assert_eq!(
        db.create_database("d"),
        Outcome::Skipped(Rejection::DatabaseExists("d".into()))
    );
    db.close().await.unwrap();
}

#[tokio::test]
async fn records_without_a_primary_key_are_refused() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path()).await;
    assert!(matches!(
        db.insert_data("t", &json!({"a": 1})),
        Outcome::Skipped(Rejection::InvalidRecord(_))
    ));
    assert!(db.insert_data("t", &json!({"id": 0, "a": 1})).is_applied());

    let inserted = db.insert_batch("t", &[json!({"id": 1}), json!({"b": 2}), json!({"id": 2})]);
    assert_eq!(inserted, Outcome::Applied(2));
    assert!(db.insert_batch("t", &[]).rejection().is_some());
    db.close().await.unwrap();
}

#[tokio::test]
async fn locked_tables_refuse_writes_until_released() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path()).await;

    let guard = db.lock_table("t").applied().unwrap();
    assert!(db.is_locked("t"));
    assert_eq!(
        db.insert_data("t", &json!({"id": 1})),
        Outcome::Skipped(Rejection::TableLocked("t".into()))
    );
    assert!(matches!(db.lock_table("t"), Outcome::Skipped(Rejection::TableLocked(_))));
    drop(guard);

    assert!(!db.is_locked("t"));
    assert!(db.insert_data("t", &json!({"id": 1})).is_applied());
    db.close().await.unwrap();
}

#[tokio::test]
async fn key_lookup_agrees_with_a_scan() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path()).await;
    let batch: Vec<Value> = (0..50).map(|i| json!({"id": i, "v": i % 7})).collect();
    db.insert_batch("t", &batch).applied().unwrap();

    let by_key = select(&db, "t", json!({"id": {"_op": "=", "_value": 42}}));
    let by_scan = select(&db, "t", json!({"v": 0, "id": {"_op": "between", "_value": [40, 45]}}));
    assert_eq!(by_key, vec![rec(json!({"id": 42, "v": 0}))]);
    assert_eq!(by_key, by_scan);
    db.close().await.unwrap();
}

#[tokio::test]
async fn numbers_compare_numerically_before_text() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path()).await;
    db.insert_data("t", &json!({"id": 1, "v": "10"})).applied().unwrap();
    db.insert_data("t", &json!({"id": 2, "v": "8"})).applied().unwrap();

    let rows = select(&db, "t", json!({"v": {"_op": ">", "_value": 9}}));
    assert_eq!(texts(&rows, "id"), vec!["1"]);
    db.close().await.unwrap();
}

#[tokio::test]
async fn updates_merge_patches_and_move_changed_keys() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path()).await;
    db.insert_batch("t", &[json!({"id": 1, "a": "x"}), json!({"id": 2, "a": "y"})])
        .applied()
        .unwrap();

    let updated = db.update_data("t", &json!({"a": "x"}), &json!({"b": true})).unwrap();
    assert_eq!(updated, Outcome::Applied(1));
    let rows = select(&db, "t", json!({"id": 1}));
    assert_eq!(rows[0].get("b"), Some(&FieldValue::Text("true".into())));

    let moved = db.update_batch("t", &[(FieldValue::from(2), json!({"id": 20}))]);
    assert_eq!(moved, Outcome::Applied(1));
    assert!(select(&db, "t", json!({"id": 2})).is_empty());
    assert_eq!(texts(&select(&db, "t", json!({"id": 20})), "a"), vec!["y"]);

    let cleared = db.update_data("t", &json!({"id": 20}), &json!({"id": null})).unwrap();
    assert_eq!(cleared, Outcome::Applied(0));
    let emptied = db.update_batch("t", &[(FieldValue::from(20), json!({"id": ""}))]);
    assert_eq!(emptied, Outcome::Applied(0));
    assert_eq!(texts(&select(&db, "t", json!({})), "id"), vec!["1", "20"]);

    assert!(db.update_data("t", &json!({}), &json!({})).unwrap().rejection().is_some());
    assert!(db.update_data("t", &json!([1]), &json!({"a": 1})).is_err());
    db.close().await.unwrap();
}

#[tokio::test]
async fn subqueries_read_other_tables() {
    let dir = tempdir().unwrap();
    let db = open(dir.path()).await;
    db.create_database("shop").applied().unwrap();
    db.use_database("shop").applied().unwrap();
    db.create_table("users", TableSpec::keyed("id", 2)).applied().unwrap();
    db.create_table("orders", TableSpec::keyed("id", 2)).applied().unwrap();
    db.insert_batch("users", &[json!({"id": 1, "name": "ann"}), json!({"id": 2, "name": "bob"})])
        .applied()
        .unwrap();
    db.insert_batch(
        "orders",
        &[
            json!({"id": 10, "user_id": 1}),
            json!({"id": 11, "user_id": 2}),
            json!({"id": 12, "user_id": 2}),
        ],
    )
    .applied()
    .unwrap();

    let bobs = select(
        &db,
        "orders",
        json!({"user_id": {"column": "id", "subquery": "select id from users where name = 'bob'"}}),
    );
    assert_eq!(texts(&bobs, "id"), vec!["11", "12"]);

    let nowhere = select(
        &db,
        "orders",
        json!({"user_id": {"column": "id", "subquery": "select id from ghosts"}}),
    );
    assert!(nowhere.is_empty());
    db.close().await.unwrap();
}

#[tokio::test]
async fn composite_index_follows_inserts_and_updates() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path()).await;
    db.insert_batch(
        "t",
        &[
            json!({"id": 1, "a": "x", "b": 3}),
            json!({"id": 2, "a": "y", "b": 5}),
            json!({"id": 3, "a": "x", "b": 8}),
        ],
    )
    .applied()
    .unwrap();
    assert_eq!(db.create_composite_index("t", &["a", "b"]), Outcome::Applied("a|b".to_string()));
    assert!(matches!(
        db.create_composite_index("t", &["a", "b"]),
        Outcome::Skipped(Rejection::IndexExists(_))
    ));

    let range = json!({"b": [2, 6], "a": "x"});
    let hits = db.query_composite_index_range("t", &range).unwrap().applied().unwrap();
    assert_eq!(texts(&hits, "id"), vec!["1"]);

    db.insert_data("t", &json!({"id": 4, "a": "x", "b": 4})).applied().unwrap();
    db.update_data("t", &json!({"id": 1}), &json!({"b": 9})).unwrap().applied().unwrap();
    let hits = db.query_composite_index_range("t", &range).unwrap().applied().unwrap();
    assert_eq!(texts(&hits, "id"), vec!["4"]);

    assert!(matches!(
        db.query_composite_index_range("t", &json!({"c": 1})).unwrap(),
        Outcome::Skipped(Rejection::IndexMissing(_))
    ));
    assert!(db.query_composite_index_range("t", &json!("a")).is_err());
    assert_eq!(db.drop_composite_indexes("t"), Outcome::Applied(1));
    db.close().await.unwrap();
}

#[tokio::test]
async fn dimension_queries_skip_stale_postings() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path()).await;
    db.insert_batch("t", &[json!({"id": 1, "a": "x"}), json!({"id": 2, "a": "y"}), json!({"id": 3, "a": "x"})])
        .applied()
        .unwrap();
    assert_eq!(texts(&db.query_dimension("t", "a", "x").applied().unwrap(), "id"), vec!["1", "3"]);

    db.update_data("t", &json!({"id": 1}), &json!({"a": "z"})).unwrap().applied().unwrap();
    assert_eq!(texts(&db.query_dimension("t", "a", "x").applied().unwrap(), "id"), vec!["3"]);

    assert_eq!(db.add_dimension("t", "c"), Outcome::Applied(3));
    assert_eq!(db.query_dimension("t", "c", FieldValue::Null).applied().unwrap().len(), 3);
    assert_eq!(db.remove_dimension("t", "c"), Outcome::Applied(3));
    assert!(db.remove_dimension("t", "id").rejection().is_some());
    db.close().await.unwrap();
}

#[tokio::test]
async fn nearest_neighbour_indexes_answer_from_their_table() {
    let dir = tempdir().unwrap();
    let db = open(dir.path()).await;
    db.create_database("geo").applied().unwrap();
    db.use_database("geo").applied().unwrap();
    db.create_table("pts", TableSpec::keyed("name", 2)).applied().unwrap();
    db.insert_batch(
        "pts",
        &[
            json!({"name": "origin", "x": 0, "y": 0}),
            json!({"name": "mid", "x": 50, "y": 50}),
            json!({"name": "far", "x": 100, "y": 100}),
        ],
    )
    .applied()
    .unwrap();

    assert_eq!(db.create_pyramid_index("pts", 1, 1), Outcome::Applied(3));
    let nearest = db.query_pyramid_index(&[1.0, 1.0]).applied().unwrap();
    assert_eq!(texts(&nearest, "name"), vec!["origin"]);
    assert!(db.drop_pyramid_index());
    assert!(matches!(
        db.query_pyramid_index(&[1.0, 1.0]),
        Outcome::Skipped(Rejection::IndexMissing(_))
    ));

    let dims = db.create_recursive_sphere_weaving("pts", Some(&["x", "y"])).applied().unwrap();
    assert_eq!(dims, vec!["x", "y"]);
    let nearest = db.query_recursive_sphere_weaving("pts", &[0.0, 0.0], 1).applied().unwrap();
    assert_eq!(texts(&nearest, "name"), vec!["origin"]);
    assert!(db.drop_sphere_index());
    db.close().await.unwrap();
}

#[tokio::test]
async fn saved_databases_reload_on_open() {
    let dir = tempdir().unwrap();
    let before = {
        let db = open_with_table(dir.path()).await;
        db.insert_batch(
            "t",
            &[
                json!({"id": 1, "a": 5, "b": null}),
                json!({"id": 2, "a": 7, "c": "only here"}),
                json!({"id": 3, "a": 2.5, "b": "set"}),
            ],
        )
        .applied()
        .unwrap();
        let rows = select(&db, "t", json!({}));
        db.close().await.unwrap();
        rows
    };
    assert!(dir.path().join("d.db").exists());

    let db = open(dir.path()).await;
    assert_eq!(db.list_databases(), vec!["d"]);
    db.use_database("d").applied().unwrap();
    assert_eq!(db.list_tables(), Outcome::Applied(vec!["t".to_string()]));

    let after = select(&db, "t", json!({}));
    assert_eq!(as_text_rows(&after), as_text_rows(&before));

    assert_eq!(texts(&select(&db, "t", json!({"b": null})), "id"), vec!["1"]);
    assert_eq!(texts(&select(&db, "t", json!({"c": "only here"})), "id"), vec!["2"]);
    let rows = select(&db, "t", json!({"a": {"_op": ">", "_value": 6}}));
    assert_eq!(texts(&rows, "id"), vec!["2"]);
    assert_eq!(db.stats().records, 3);
    db.close().await.unwrap();
}

#[tokio::test]
async fn compressed_tables_persist_directions_and_accept_hashed_keys() {
    let dir = tempdir().unwrap();
    {
        let db = open_with_table(dir.path()).await;
        db.insert_batch("t", &[json!({"id": 1, "x": 3, "y": 4}), json!({"id": 2, "label": "none"})])
            .applied()
            .unwrap();
        assert!(db.enable_compression("t").is_applied());

        let hashed = PartitionedTable::hashed_key("1");
        assert_eq!(db.update_batch("t", &[(FieldValue::Text(hashed), json!({"x": 6}))]), Outcome::Applied(1));
        db.close().await.unwrap();
    }

    let db = open(dir.path()).await;
    db.use_database("d").applied().unwrap();
    let rows = select(&db, "t", json!({}));
    assert_eq!(texts(&rows, "id"), vec!["1", "2"]);
    for row in &rows {
        for axis in ["x", "y", "z"] {
            assert!(row.get(axis).and_then(FieldValue::as_number).is_some(), "{} missing", axis);
        }
    }
    db.close().await.unwrap();
}

#[tokio::test]
async fn mount_and_demount_external_files() {
    let source_dir = tempdir().unwrap();
    let file = source_dir.path().join("d.db");
    {
        let db = open_with_table(source_dir.path()).await;
        db.insert_batch("t", &[json!({"id": 1}), json!({"id": 2})]).applied().unwrap();
        db.close().await.unwrap();
    }

    let dir = tempdir().unwrap();
    let db = open(dir.path()).await;
    assert_eq!(db.mount("ext", &file).await.unwrap(), Outcome::Applied(1));
    db.use_database("ext").applied().unwrap();
    db.insert_data("t", &json!({"id": 3})).applied().unwrap();
    assert_eq!(db.demount("ext").await.unwrap(), Outcome::Applied(()));
    assert!(db.list_databases().is_empty());
    assert_eq!(db.current_database(), None);

    db.mount("ext", &file).await.unwrap().applied().unwrap();
    db.use_database("ext").applied().unwrap();
    assert_eq!(texts(&select(&db, "t", json!({})), "id"), vec!["1", "2", "3"]);

    let missing = dir.path().join("nowhere.db");
    assert_eq!(
        db.mount("ghost", &missing).await.unwrap(),
        Outcome::Skipped(Rejection::StoreNotFound(missing))
    );
    assert_eq!(
        db.demount("d").await.unwrap(),
        Outcome::Skipped(Rejection::NotMounted("d".into()))
    );
    db.close().await.unwrap();
}

#[tokio::test]
async fn dropping_a_database_removes_its_file() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path()).await;
    db.insert_data("t", &json!({"id": 1})).applied().unwrap();
    db.flush().await;
    let file = dir.path().join("d.db");
    assert!(file.exists());

    assert!(db.drop_database("d").is_applied());
    db.flush().await;
    assert!(!file.exists());
    assert_eq!(db.current_database(), None);
    assert_eq!(db.list_tables(), Outcome::Skipped(Rejection::NoDatabaseSelected));
    db.close().await.unwrap();
}

#[tokio::test]
async fn clones_are_independent_copies() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path()).await;
    db.insert_data("t", &json!({"id": 1, "a": 1})).applied().unwrap();

    assert!(db.clone_table("t", "t2").is_applied());
    db.delete_data("t2", &json!({})).unwrap().applied().unwrap();
    assert_eq!(select(&db, "t", json!({})).len(), 1);

    assert!(db.clone_database("d", "d2").is_applied());
    db.use_database("d2").applied().unwrap();
    assert_eq!(db.list_tables(), Outcome::Applied(vec!["t".to_string(), "t2".to_string()]));
    db.close().await.unwrap();
}

#[tokio::test]
async fn stats_track_catalog_and_activity() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path()).await;
    db.insert_batch("t", &[json!({"id": 1, "a": 1}), json!({"id": 2, "a": 2})])
        .applied()
        .unwrap();
    select(&db, "t", json!({}));
    select(&db, "t", json!({}));

    let stats = db.stats();
    assert_eq!(stats.current_database.as_deref(), Some("d"));
    assert_eq!((stats.databases, stats.tables, stats.records), (1, 1, 2));
    assert_eq!(stats.queries, 2);
    assert!(stats.writes >= 2);
    assert!(stats.dimension_indexes >= 2);
    assert_eq!(stats.cache_stats.hit_count, 1);

    db.close().await.unwrap();
    assert_eq!(db.insert_data("t", &json!({"id": 3})), Outcome::Skipped(Rejection::Closed));
}
