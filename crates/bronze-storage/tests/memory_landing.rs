use bronze_core::{
    enrich, Column, ColumnType, HashSpec, Record, TableRef, TableShape, BK_HASH_COLUMN,
    ROW_HASH_COLUMN,
};
use bronze_storage::{
    ensure_namespace, provision, read_table, write_batch, BackoffPolicy, LandingTarget,
    MemoryStore, MergeReport, StoreError,
};
use chrono::{TimeZone, Utc};
use std::collections::HashSet;

fn order(bk: &str, col5: &str) -> Record {
    Record::new()
        .with("col1_bk", bk)
        .with("col2_bk", "SRC-1")
        .with("col3_fk", Some("HUB-100"))
        .with("col4_fk", None::<&str>)
        .with("col5", col5)
        .with("col6", "17")
        .with("col7", None::<&str>)
        .with("col8", None::<&str>)
}

fn hashed(records: &[Record], hour: u32) -> Vec<Record> {
    let now = Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).single().unwrap();
    records
        .iter()
        .map(|r| {
            enrich(r, &HashSpec::default(), "GEN_SYNTH", now)
                .unwrap()
                .into_record()
        })
        .collect()
}

fn shape_for(target: &LandingTarget) -> TableShape {
    let raw = TableShape::infer(&[order("A", "x")]).unwrap();
    match target.identity {
        Some(_) => raw.with_hash_columns(),
        None => raw,
    }
}

async fn land(
    store: &MemoryStore,
    target: &LandingTarget,
    batch: &[Record],
) -> Result<MergeReport, StoreError> {
    write_batch(store, target, batch, &shape_for(target), &BackoffPolicy::default()).await
}

fn hash_target() -> LandingTarget {
    LandingTarget::hashed(TableRef::new("bronze", "orders_hash"))
}

async fn store_with_namespace() -> MemoryStore {
    let store = MemoryStore::new();
    ensure_namespace(&store, "bronze").await.unwrap();
    store
}

fn identities(rows: &[Record]) -> HashSet<(String, String)> {
    rows.iter()
        .map(|r| {
            (
                r.get(BK_HASH_COLUMN).and_then(|v| v.as_text()).unwrap().to_string(),
                r.get(ROW_HASH_COLUMN).and_then(|v| v.as_text()).unwrap().to_string(),
            )
        })
        .collect()
}

#[tokio::test]
async fn duplicate_rows_collapse_and_reruns_add_nothing() {
    let store = store_with_namespace().await;
    let target = hash_target();
    let raw = vec![order("A", "same"), order("A", "same"), order("B", "same")];

    let first = land(&store, &target, &hashed(&raw, 1))
        .await
        .unwrap();
    assert_eq!(first.processed, 3);
    assert_eq!(first.inserted, 2);
    assert_eq!(store.rows(&target.table).await.len(), 2);

    // a later run carries a new load timestamp but the same identities
    let second = land(&store, &target, &hashed(&raw, 2))
        .await
        .unwrap();
    assert_eq!(second.processed, 3);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.skipped(), 3);

    let rows = store.rows(&target.table).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(identities(&rows).len(), rows.len());
    assert_eq!(store.constraints(&target.table).await, vec!["pk_bronze_orders_hash"]);
}

#[tokio::test]
async fn changed_attributes_land_as_a_new_version() {
    let store = store_with_namespace().await;
    let target = hash_target();

    land(&store, &target, &hashed(&[order("A", "v1")], 1))
        .await
        .unwrap();
    let report = land(&store, &target, &hashed(&[order("A", "v1"), order("A", "v2")], 2))
        .await
        .unwrap();
    assert_eq!(report.inserted, 1);

    let rows = store.rows(&target.table).await;
    let bk_hashes = rows
        .iter()
        .map(|r| r.get(BK_HASH_COLUMN).cloned())
        .collect::<HashSet<_>>();
    assert_eq!(rows.len(), 2);
    assert_eq!(bk_hashes.len(), 1);
}

#[tokio::test]
async fn raw_landing_appends_every_row() {
    let store = store_with_namespace().await;
    let target = LandingTarget::raw(TableRef::new("bronze", "orders"));
    let batch = vec![order("A", "x"), order("A", "x")];

    for _ in 0..2 {
        let report = land(&store, &target, &batch)
            .await
            .unwrap();
        assert_eq!(report.inserted, 2);
    }
    assert_eq!(store.rows(&target.table).await.len(), 4);
    assert!(store.constraints(&target.table).await.is_empty());
    assert_eq!(read_table(&store, &target.table).await.unwrap(), [batch.as_slice(), batch.as_slice()].concat());
}

#[tokio::test]
async fn first_write_creates_table_from_batch_shape() {
    let store = store_with_namespace().await;
    let target = LandingTarget::raw(TableRef::new("bronze", "orders"));
    let batch = vec![order("A", "x")];
    land(&store, &target, &batch)
        .await
        .unwrap();
    assert_eq!(store.shape(&target.table).await, TableShape::infer(&batch));
}

#[tokio::test]
async fn shape_mismatch_leaves_target_untouched() {
    let store = store_with_namespace().await;
    let target = LandingTarget::raw(TableRef::new("bronze", "orders"));
    land(&store, &target, &[order("A", "x")])
        .await
        .unwrap();

    let drifted = vec![order("B", "y").with("col9", "extra")];
    let err = land(&store, &target, &drifted)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ShapeMismatch { .. }), "{err}");

    let wrong_type = vec![order("C", "z").with("col6", 17i64)];
    let err = land(&store, &target, &wrong_type)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ShapeMismatch { .. }), "{err}");

    assert_eq!(store.rows(&target.table).await, vec![order("A", "x")]);
    assert_eq!(store.live_staging_areas(), 0);
}

#[tokio::test]
async fn staging_areas_do_not_outlive_batch_writes() {
    let store = store_with_namespace().await;
    let target = hash_target();
    let batch = hashed(&[order("A", "x"), order("B", "y")], 1);
    land(&store, &target, &batch)
        .await
        .unwrap();
    assert_eq!(store.live_staging_areas(), 0);
}

#[tokio::test]
async fn empty_batch_is_a_noop() {
    let store = store_with_namespace().await;
    let target = hash_target();
    let report = land(&store, &target, &[])
        .await
        .unwrap();
    assert_eq!(report.processed, 0);
    assert!(store.shape(&target.table).await.is_none());
    assert!(read_table(&store, &target.table).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_namespace_fails_without_retry() {
    let store = MemoryStore::new();
    let target = hash_target();
    let err = land(&store, &target, &hashed(&[order("A", "x")], 1))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Rejected(_)));
}

#[tokio::test]
async fn concurrent_first_time_provisioning_yields_one_constraint() {
    let store = store_with_namespace().await;
    let target = hash_target();
    let shape = shape_for(&target);

    let tasks = (0..2)
        .map(|_| {
            let store = store.clone();
            let target = target.clone();
            let shape = shape.clone();
            tokio::spawn(async move { provision(&store, &target, &shape).await })
        })
        .collect::<Vec<_>>();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(store.constraints(&target.table).await, vec!["pk_bronze_orders_hash"]);
}

#[tokio::test]
async fn concurrent_writers_never_duplicate_identities() {
    let store = store_with_namespace().await;
    let target = hash_target();
    let batch = hashed(&[order("A", "x"), order("A", "x"), order("B", "x")], 1);

    let tasks = (0..4)
        .map(|_| {
            let store = store.clone();
            let target = target.clone();
            let batch = batch.clone();
            tokio::spawn(async move { land(&store, &target, &batch).await })
        })
        .collect::<Vec<_>>();

    let mut inserted = 0;
    for task in tasks {
        inserted += task.await.unwrap().unwrap().inserted;
    }
    assert_eq!(inserted, 2);
    assert_eq!(store.rows(&target.table).await.len(), 2);
}

#[tokio::test]
async fn declared_shape_survives_leading_null_batches() {
    let store = store_with_namespace().await;
    let target = LandingTarget::raw(TableRef::new("bronze", "line_items"));
    let shape = TableShape::new(vec![
        Column::new("sku", ColumnType::Text),
        Column::new("qty", ColumnType::BigInt),
    ]);
    let first = vec![Record::new().with("sku", "S-1").with("qty", None::<i64>)];
    let second = vec![Record::new().with("sku", "S-2").with("qty", 5i64)];

    for batch in [&first, &second] {
        write_batch(&store, &target, batch, &shape, &BackoffPolicy::default())
            .await
            .unwrap();
    }
    assert_eq!(store.shape(&target.table).await, Some(shape));
    assert_eq!(store.rows(&target.table).await.len(), 2);
}
