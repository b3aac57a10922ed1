//! Runs against a live database only when `DATABASE_URL` is set.

use bronze_core::{enrich, Column, ColumnType, HashSpec, Record, TableRef, TableShape};
use bronze_storage::{
    ensure_namespace, provision, read_table, write_batch, BackoffPolicy, LandingTarget, PgStore,
    StoreError,
};
use chrono::{TimeZone, Utc};

async fn connect(test: &str) -> Option<(PgStore, String)> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping {test}");
        return None;
    };
    let store = PgStore::connect(&url, 4).await.unwrap();
    let schema = format!("bronze_it_{}_{test}", std::process::id());
    ensure_namespace(&store, &schema).await.unwrap();
    Some((store, schema))
}

async fn cleanup(store: &PgStore, schema: &str) {
    sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{schema}\" CASCADE"))
        .execute(store.pool())
        .await
        .unwrap();
}

fn hashed_orders(col5: &[(&str, &str)]) -> Vec<Record> {
    let now = Utc.with_ymd_and_hms(2026, 2, 24, 9, 30, 0).single().unwrap();
    col5.iter()
        .map(|(bk, v)| {
            let raw = Record::new()
                .with("col1_bk", *bk)
                .with("col2_bk", "SRC-2")
                .with("col3_fk", None::<&str>)
                .with("col4_fk", Some("HUB-1500"))
                .with("col5", *v)
                .with("col6", "42")
                .with("col7", None::<&str>)
                .with("col8", Some("abcdefghijkl"));
            enrich(&raw, &HashSpec::default(), "GEN_SYNTH", now)
                .unwrap()
                .into_record()
        })
        .collect()
}

fn hashed_shape() -> TableShape {
    let raw = ["col1_bk", "col2_bk", "col3_fk", "col4_fk", "col5", "col6", "col7", "col8"]
        .iter()
        .map(|name| Column::new(*name, ColumnType::Text))
        .collect();
    TableShape::new(raw).with_hash_columns()
}

fn id_name_shape() -> TableShape {
    TableShape::new(vec![
        Column::new("id", ColumnType::BigInt),
        Column::new("name", ColumnType::Text),
    ])
}

#[tokio::test]
async fn hashed_landing_is_idempotent() {
    let Some((store, schema)) = connect("idempotent").await else {
        return;
    };
    let target = LandingTarget::hashed(TableRef::new(&schema, "orders_hash"));
    let batch = hashed_orders(&[("A", "x"), ("A", "x"), ("B", "x")]);

    let shape = hashed_shape();
    let first = write_batch(&store, &target, &batch, &shape, &BackoffPolicy::default())
        .await
        .unwrap();
    let second = write_batch(&store, &target, &batch, &shape, &BackoffPolicy::default())
        .await
        .unwrap();
    assert_eq!((first.processed, first.inserted), (3, 2));
    assert_eq!((second.processed, second.inserted), (3, 0));

    let rows = read_table(&store, &target.table).await.unwrap();
    assert_eq!(rows.len(), 2);
    // timestamps and nulls survive the round trip through the table
    assert!(rows.contains(&batch[0]));

    cleanup(&store, &schema).await;
}

#[tokio::test]
async fn concurrent_provisioning_adds_one_primary_key() {
    let Some((store, schema)) = connect("provision").await else {
        return;
    };
    let target = LandingTarget::hashed(TableRef::new(&schema, "orders_hash"));
    let shape = hashed_shape();

    let (left, right) = tokio::join!(
        provision(&store, &target, &shape),
        provision(&store, &target, &shape)
    );
    left.unwrap();
    right.unwrap();

    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM pg_constraint WHERE conrelid = $1::text::regclass AND contype = 'p'",
    )
    .bind(target.table.to_string())
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(count, 1);

    cleanup(&store, &schema).await;
}

#[tokio::test]
async fn shape_mismatch_rolls_back_the_batch() {
    let Some((store, schema)) = connect("mismatch").await else {
        return;
    };
    let target = LandingTarget::raw(TableRef::new(&schema, "orders"));
    let shape = id_name_shape();
    let original = vec![Record::new().with("id", 1i64).with("name", "first")];
    write_batch(&store, &target, &original, &shape, &BackoffPolicy::default())
        .await
        .unwrap();

    let drifted = vec![Record::new().with("id", "one").with("name", "second")];
    let err = write_batch(&store, &target, &drifted, &shape, &BackoffPolicy::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ShapeMismatch { .. }), "{err}");
    assert_eq!(read_table(&store, &target.table).await.unwrap(), original);

    cleanup(&store, &schema).await;
}

#[tokio::test]
async fn raw_landing_appends_duplicates() {
    let Some((store, schema)) = connect("raw_append").await else {
        return;
    };
    let target = LandingTarget::raw(TableRef::new(&schema, "orders"));
    let batch = vec![
        Record::new().with("id", 7i64).with("name", None::<&str>),
        Record::new().with("id", 7i64).with("name", None::<&str>),
    ];
    for _ in 0..2 {
        write_batch(&store, &target, &batch, &id_name_shape(), &BackoffPolicy::default())
            .await
            .unwrap();
    }
    assert_eq!(read_table(&store, &target.table).await.unwrap().len(), 4);

    cleanup(&store, &schema).await;
}
