//! Staging, provisioning and merge of record batches into bronze target tables.
//!
//! Every batch write runs in one store session (one transaction): the target is
//! provisioned, the batch is staged into a private holding area, the optional
//! identity constraint is ensured, and the staged rows are merged. Any failure
//! drops the session and with it every change made to the target.

use std::time::Duration;

use async_trait::async_trait;
use bronze_core::{Record, TableRef, TableShape, HASH_IDENTITY_COLUMNS};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "bronze-storage";

/// Longest identifier Postgres keeps without truncation.
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("batch does not match the shape of {table}: {detail}")]
    ShapeMismatch { table: String, detail: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("constraint {constraint} was added concurrently")]
    ConstraintRace { constraint: String },
    #[error("table {0} does not exist")]
    MissingTable(String),
    #[error("store rejected the operation: {0}")]
    Rejected(String),
    #[error(transparent)]
    Database(sqlx::Error),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Transport(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match classify_sqlx_error(&err) {
            RetryDisposition::Retryable => StoreError::Transport(err.to_string()),
            RetryDisposition::NonRetryable => StoreError::Database(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RetryDisposition::Retryable,
        // serialization_failure, deadlock_detected
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("40001" | "40P01")) => {
            RetryDisposition::Retryable
        }
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Pause before re-running a batch that failed with `err` on attempt `attempt`
    /// (zero based); `None` when the batch must not be retried.
    pub fn retry_after(&self, err: &StoreError, attempt: usize) -> Option<Duration> {
        if err.disposition() != RetryDisposition::Retryable || attempt >= self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

/// Private holding area filled by [`stage`] and consumed by [`merge`].
#[derive(Debug)]
pub struct StagingHandle {
    name: String,
    columns: Vec<String>,
    row_count: u64,
}

impl StagingHandle {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            row_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Rows present in the merged batch.
    pub processed: u64,
    /// Rows actually written to the target.
    pub inserted: u64,
}

impl MergeReport {
    /// Rows dropped because their identity already existed.
    pub fn skipped(&self) -> u64 {
        self.processed.saturating_sub(self.inserted)
    }

    pub fn absorb(&mut self, other: MergeReport) {
        self.processed += other.processed;
        self.inserted += other.inserted;
    }
}

/// Composite primary key guarding a hashed target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub constraint: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandingTarget {
    pub table: TableRef,
    pub identity: Option<Identity>,
}

impl LandingTarget {
    /// Append-only target without identity.
    pub fn raw(table: TableRef) -> Self {
        Self {
            table,
            identity: None,
        }
    }

    /// Deduplicated target keyed on `(bk_hash, row_hash)` via `pk_<schema>_<table>`.
    pub fn hashed(table: TableRef) -> Self {
        let constraint = format!("pk_{}_{}", table.schema, table.name)
            .chars()
            .take(MAX_IDENTIFIER_LEN)
            .collect();
        Self {
            table,
            identity: Some(Identity {
                constraint,
                columns: HASH_IDENTITY_COLUMNS.iter().map(|c| c.to_string()).collect(),
            }),
        }
    }

    fn identity_columns(&self) -> Option<&[String]> {
        self.identity.as_ref().map(|i| i.columns.as_slice())
    }
}

/// Entry point to a backend; each session is one transactional unit of work.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError>;
}

/// Store primitives, all scoped to the session's transaction.
///
/// Dropping a session without [`StoreSession::commit`] discards its changes.
#[async_trait]
pub trait StoreSession: Send {
    async fn create_namespace(&mut self, namespace: &str) -> Result<(), StoreError>;

    /// Serialises provisioning of `table` against other sessions until this one ends.
    async fn lock_table(&mut self, table: &TableRef) -> Result<(), StoreError>;

    async fn describe_table(&mut self, table: &TableRef) -> Result<Option<TableShape>, StoreError>;

    async fn create_table(&mut self, table: &TableRef, shape: &TableShape) -> Result<(), StoreError>;

    async fn constraint_exists(&mut self, table: &TableRef, constraint: &str)
        -> Result<bool, StoreError>;

    /// Fails with [`StoreError::ConstraintRace`] when another session got there first.
    async fn add_primary_key(
        &mut self,
        table: &TableRef,
        constraint: &str,
        columns: &[String],
    ) -> Result<(), StoreError>;

    /// Fresh, empty holding area with exactly the columns of `shape`.
    async fn create_staging(
        &mut self,
        target: &TableRef,
        shape: &TableShape,
    ) -> Result<StagingHandle, StoreError>;

    async fn insert_rows(
        &mut self,
        staging: &StagingHandle,
        shape: &TableShape,
        rows: &[Record],
    ) -> Result<u64, StoreError>;

    /// Copies staged rows into `target`; with conflict columns, rows whose key already
    /// exists are skipped. Returns the number of rows written.
    async fn insert_from_staging(
        &mut self,
        staging: &StagingHandle,
        target: &TableRef,
        conflict_columns: Option<&[String]>,
    ) -> Result<u64, StoreError>;

    async fn drop_staging(&mut self, staging: StagingHandle) -> Result<(), StoreError>;

    async fn select_all(
        &mut self,
        table: &TableRef,
        shape: &TableShape,
    ) -> Result<Vec<Record>, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}

/// Creates `table` from `shape` unless it exists; returns the table's actual shape.
pub async fn ensure_table(
    session: &mut dyn StoreSession,
    table: &TableRef,
    shape: &TableShape,
) -> Result<TableShape, StoreError> {
    session.lock_table(table).await?;
    if let Some(existing) = session.describe_table(table).await? {
        return Ok(existing);
    }
    session.create_table(table, shape).await?;
    info!(%table, columns = shape.len(), "created target table");
    Ok(shape.clone())
}

/// Adds the primary key once. Returns whether this call created it.
pub async fn ensure_identity(
    session: &mut dyn StoreSession,
    table: &TableRef,
    identity: &Identity,
) -> Result<bool, StoreError> {
    session.lock_table(table).await?;
    if session.constraint_exists(table, &identity.constraint).await? {
        return Ok(false);
    }
    match session
        .add_primary_key(table, &identity.constraint, &identity.columns)
        .await
    {
        Ok(()) => {
            info!(%table, constraint = %identity.constraint, "added identity constraint");
            Ok(true)
        }
        Err(StoreError::ConstraintRace { constraint }) => {
            debug!(%table, %constraint, "identity constraint already added by another session");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Validates `batch` against `shape` and loads it into a fresh holding area.
pub async fn stage(
    session: &mut dyn StoreSession,
    batch: &[Record],
    target: &TableRef,
    shape: &TableShape,
) -> Result<StagingHandle, StoreError> {
    for record in batch {
        shape
            .validate(record)
            .map_err(|violation| StoreError::ShapeMismatch {
                table: target.to_string(),
                detail: violation.to_string(),
            })?;
    }

    let mut staging = session.create_staging(target, shape).await?;
    match session.insert_rows(&staging, shape, batch).await {
        Ok(rows) => {
            staging.row_count = rows;
            debug!(staging = %staging.name, rows, "staged batch");
            Ok(staging)
        }
        Err(err) => {
            if let Err(cleanup) = session.drop_staging(staging).await {
                warn!(%target, error = %cleanup, "could not drop staging area after failed insert");
            }
            Err(err)
        }
    }
}

/// Moves staged rows into `target` and drops the holding area.
pub async fn merge(
    session: &mut dyn StoreSession,
    staging: StagingHandle,
    target: &TableRef,
    identity_columns: Option<&[String]>,
) -> Result<MergeReport, StoreError> {
    let inserted = session
        .insert_from_staging(&staging, target, identity_columns)
        .await?;
    let report = MergeReport {
        processed: staging.row_count,
        inserted,
    };
    session.drop_staging(staging).await?;
    if report.skipped() > 0 {
        debug!(%target, skipped = report.skipped(), "skipped rows with existing identity");
    }
    Ok(report)
}

pub async fn ensure_namespace(store: &dyn Store, namespace: &str) -> Result<(), StoreError> {
    let mut session = store.begin().await?;
    session.create_namespace(namespace).await?;
    session.commit().await
}

/// Provisions the target and its identity in a session of its own.
pub async fn provision(
    store: &dyn Store,
    target: &LandingTarget,
    shape: &TableShape,
) -> Result<(), StoreError> {
    let mut session = store.begin().await?;
    ensure_table(session.as_mut(), &target.table, shape).await?;
    if let Some(identity) = &target.identity {
        ensure_identity(session.as_mut(), &target.table, identity).await?;
    }
    session.commit().await
}

/// Current shape of `table`, `None` when it has not been created yet.
pub async fn describe(
    store: &dyn Store,
    table: &TableRef,
) -> Result<Option<TableShape>, StoreError> {
    let mut session = store.begin().await?;
    let shape = session.describe_table(table).await?;
    session.commit().await?;
    Ok(shape)
}

/// Reads every row of `table`; empty when the table has not been created yet.
pub async fn read_table(store: &dyn Store, table: &TableRef) -> Result<Vec<Record>, StoreError> {
    let mut session = store.begin().await?;
    let Some(shape) = session.describe_table(table).await? else {
        return Ok(Vec::new());
    };
    let rows = session.select_all(table, &shape).await?;
    session.commit().await?;
    Ok(rows)
}

/// Writes one batch in a single transaction, retrying transport failures.
///
/// `shape` is the declared shape of the batch and creates the target on first write;
/// an existing target keeps its own shape and the batch is validated against it.
pub async fn write_batch(
    store: &dyn Store,
    target: &LandingTarget,
    batch: &[Record],
    shape: &TableShape,
    backoff: &BackoffPolicy,
) -> Result<MergeReport, StoreError> {
    if batch.is_empty() {
        return Ok(MergeReport::default());
    }

    let span = info_span!("write_batch", table = %target.table, rows = batch.len());
    async move {
        let mut attempt = 0;
        loop {
            match write_batch_once(store, target, batch, shape).await {
                Ok(report) => {
                    info!(
                        processed = report.processed,
                        inserted = report.inserted,
                        "merged batch"
                    );
                    return Ok(report);
                }
                Err(err) => {
                    let Some(delay) = backoff.retry_after(&err, attempt) else {
                        return Err(err);
                    };
                    warn!(attempt, error = %err, ?delay, "retrying batch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
    .instrument(span)
    .await
}

async fn write_batch_once(
    store: &dyn Store,
    target: &LandingTarget,
    batch: &[Record],
    shape: &TableShape,
) -> Result<MergeReport, StoreError> {
    let mut session = store.begin().await?;
    let actual = ensure_table(session.as_mut(), &target.table, shape).await?;
    let staging = stage(session.as_mut(), batch, &target.table, &actual).await?;
    if let Some(identity) = &target.identity {
        ensure_identity(session.as_mut(), &target.table, identity).await?;
    }
    let report = merge(
        session.as_mut(),
        staging,
        &target.table,
        target.identity_columns(),
    )
    .await?;
    session.commit().await?;
    Ok(report)
}

pub(crate) fn staging_name(target: &TableRef) -> String {
    format!("_{}_stage", target.name)
        .chars()
        .take(MAX_IDENTIFIER_LEN)
        .collect()
}
