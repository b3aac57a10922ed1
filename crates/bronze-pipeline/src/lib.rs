//! Landing run orchestration: namespace, raw layer, hashed layer.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bronze_core::{enrich_batch, HashSpec, HashedRecord, Record, TableRef, TableShape};
use bronze_source::{RecordSource, SyntheticOrders, DEFAULT_SEED};
use bronze_storage::{
    describe, ensure_namespace, read_table, write_batch, BackoffPolicy, LandingTarget, MergeReport, PgStore,
    Store,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bronze-pipeline";

const HASHED_SUFFIX: &str = "_hash";

#[derive(Clone)]
pub struct LandingConfig {
    pub database_url: Option<String>,
    pub pg_host: String,
    pub pg_port: u16,
    pub pg_db: String,
    pub pg_user: String,
    pub pg_password: String,
    pub max_connections: u32,
    pub schema: String,
    pub table_name: String,
    pub record_source: String,
    pub row_count: usize,
    pub seed: u64,
    pub batch_size: usize,
    pub max_retries: usize,
    pub hash_spec: HashSpec,
}

impl Default for LandingConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            pg_host: "localhost".to_string(),
            pg_port: 5432,
            pg_db: "warehouse".to_string(),
            pg_user: "postgres".to_string(),
            pg_password: "postgres".to_string(),
            max_connections: 5,
            schema: "bronze".to_string(),
            table_name: "orders".to_string(),
            record_source: "GEN_SYNTH".to_string(),
            row_count: 1000,
            seed: DEFAULT_SEED,
            batch_size: 5000,
            max_retries: BackoffPolicy::default().max_retries,
            hash_spec: HashSpec::default(),
        }
    }
}

impl LandingConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparsable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let text = |key: &str, default: String| lookup(key).unwrap_or(default);

        let hash_spec = match (lookup("LANDING_BUSINESS_KEY"), lookup("LANDING_ATTRIBUTES")) {
            (None, None) => defaults.hash_spec,
            (business_key, attributes) => {
                let defaults = HashSpec::default();
                let business_key = business_key
                    .map(|v| split_columns(&v))
                    .unwrap_or_else(|| defaults.business_key().to_vec());
                let attributes = attributes
                    .map(|v| split_columns(&v))
                    .unwrap_or_else(|| defaults.attributes().to_vec());
                HashSpec::new(business_key, attributes).context("invalid hash columns")?
            }
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            pg_host: text("PG_HOST", defaults.pg_host),
            pg_port: parse(lookup("PG_PORT")).unwrap_or(defaults.pg_port),
            pg_db: text("PG_DB", defaults.pg_db),
            pg_user: text("PG_USER", defaults.pg_user),
            pg_password: text("PG_PASSWORD", defaults.pg_password),
            max_connections: parse(lookup("PG_MAX_CONNECTIONS")).unwrap_or(defaults.max_connections),
            schema: text("PG_SCHEMA", defaults.schema),
            table_name: text("TABLE_NAME", defaults.table_name),
            record_source: text("RECORD_SOURCE", defaults.record_source),
            row_count: parse(lookup("ROW_COUNT")).unwrap_or(defaults.row_count),
            seed: parse(lookup("LANDING_SEED")).unwrap_or(defaults.seed),
            batch_size: parse(lookup("LANDING_BATCH_SIZE")).unwrap_or(defaults.batch_size),
            max_retries: parse(lookup("LANDING_MAX_RETRIES")).unwrap_or(defaults.max_retries),
            hash_spec,
        })
    }

    /// `DATABASE_URL` when set, otherwise assembled from the `PG_*` parts.
    pub fn database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.pg_user, self.pg_password, self.pg_host, self.pg_port, self.pg_db
            ),
        }
    }

    pub fn raw_table(&self) -> TableRef {
        TableRef::new(&self.schema, &self.table_name)
    }

    pub fn hashed_table(&self) -> TableRef {
        self.raw_table().with_suffix(HASHED_SUFFIX)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            ..BackoffPolicy::default()
        }
    }
}

impl fmt::Debug for LandingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LandingConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("pg_host", &self.pg_host)
            .field("pg_port", &self.pg_port)
            .field("pg_db", &self.pg_db)
            .field("pg_user", &self.pg_user)
            .field("pg_password", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("schema", &self.schema)
            .field("table_name", &self.table_name)
            .field("record_source", &self.record_source)
            .field("row_count", &self.row_count)
            .field("seed", &self.seed)
            .field("batch_size", &self.batch_size)
            .field("max_retries", &self.max_retries)
            .field("hash_spec", &self.hash_spec)
            .finish()
    }
}

fn parse<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

fn split_columns(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub raw_table: String,
    pub hashed_table: String,
    pub raw_rows: u64,
    /// Rows fed into the hashed layer, whether or not they were new.
    pub hashed_processed: u64,
    pub hashed_inserted: u64,
}

pub struct LandingPipeline {
    config: LandingConfig,
    store: Arc<dyn Store>,
    source: Box<dyn RecordSource>,
}

impl LandingPipeline {
    pub fn new(config: LandingConfig, store: Arc<dyn Store>) -> Self {
        let source = Box::new(SyntheticOrders::new(config.seed));
        Self {
            config,
            store,
            source,
        }
    }

    pub fn with_source(mut self, source: Box<dyn RecordSource>) -> Self {
        self.source = source;
        self
    }

    pub fn config(&self) -> &LandingConfig {
        &self.config
    }

    pub async fn create_namespace(&self) -> Result<()> {
        ensure_namespace(self.store.as_ref(), &self.config.schema)
            .await
            .with_context(|| format!("creating schema {}", self.config.schema))
    }

    /// Appends a fresh batch from the source to the raw table; returns rows written.
    pub async fn populate_raw(&self) -> Result<u64> {
        let records = self
            .source
            .fetch(self.config.row_count)
            .await
            .with_context(|| format!("fetching from {}", self.source.source_id()))?;
        let shape = self.source.shape();
        // a bad record must fail the run before the first chunk commits
        for record in &records {
            shape
                .validate(record)
                .with_context(|| {
                    format!("{} produced a malformed record", self.source.source_id())
                })?;
        }

        let target = LandingTarget::raw(self.config.raw_table());
        let report = self.write_chunked(&target, &records, &shape).await?;
        info!(table = %target.table, rows = report.inserted, "landed raw rows");
        Ok(report.inserted)
    }

    /// Hashes the whole raw table into the hashed table; rows already present are skipped.
    pub async fn build_hashed(&self) -> Result<MergeReport> {
        let raw_table = self.config.raw_table();
        let Some(raw_shape) = describe(self.store.as_ref(), &raw_table)
            .await
            .with_context(|| format!("describing {raw_table}"))?
        else {
            info!(table = %raw_table, "raw table does not exist yet; nothing to hash");
            return Ok(MergeReport::default());
        };
        let raw = read_table(self.store.as_ref(), &raw_table)
            .await
            .with_context(|| format!("reading {raw_table}"))?;
        if raw.is_empty() {
            info!(table = %raw_table, "raw table is empty; nothing to hash");
            return Ok(MergeReport::default());
        }

        let hashed = enrich_batch(
            &raw,
            &self.config.hash_spec,
            &self.config.record_source,
            Utc::now(),
        )
        .with_context(|| format!("hashing rows of {raw_table}"))?
        .into_iter()
        .map(HashedRecord::into_record)
        .collect::<Vec<_>>();

        let target = LandingTarget::hashed(self.config.hashed_table());
        let report = self
            .write_chunked(&target, &hashed, &raw_shape.with_hash_columns())
            .await?;
        info!(
            table = %target.table,
            processed = report.processed,
            inserted = report.inserted,
            "landed hashed rows"
        );
        Ok(report)
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("landing_run", %run_id);

        async move {
            self.create_namespace().await?;
            let raw_rows = self.populate_raw().await?;
            let hashed = self.build_hashed().await?;

            Ok::<_, anyhow::Error>(RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                raw_table: self.config.raw_table().to_string(),
                hashed_table: self.config.hashed_table().to_string(),
                raw_rows,
                hashed_processed: hashed.processed,
                hashed_inserted: hashed.inserted,
            })
        }
        .instrument(span)
        .await
    }

    async fn write_chunked(
        &self,
        target: &LandingTarget,
        records: &[Record],
        shape: &TableShape,
    ) -> Result<MergeReport> {
        let backoff = self.config.backoff();
        let mut total = MergeReport::default();
        for chunk in records.chunks(self.config.batch_size.max(1)) {
            let report = write_batch(self.store.as_ref(), target, chunk, shape, &backoff)
                .await
                .with_context(|| format!("writing batch to {}", target.table))?;
            total.absorb(report);
        }
        Ok(total)
    }
}

pub async fn connect_postgres(config: &LandingConfig) -> Result<Arc<dyn Store>> {
    let store = PgStore::connect(&config.database_url(), config.max_connections).await?;
    Ok(Arc::new(store))
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = LandingConfig::from_env()?;
    let store = connect_postgres(&config).await?;
    LandingPipeline::new(config, store).run_once().await
}
