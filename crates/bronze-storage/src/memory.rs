//! In-process backend used by tests and dry runs.
//!
//! A session holds the catalog lock for its whole lifetime and works on a copy
//! that is published on commit, so sessions are serialisable and an abandoned
//! session leaves no trace.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bronze_core::{Record, TableRef, TableShape, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{staging_name, StagingHandle, Store, StoreError, StoreSession};

#[derive(Debug, Clone, Default)]
struct Catalog {
    namespaces: BTreeSet<String>,
    tables: BTreeMap<TableRef, MemTable>,
}

#[derive(Debug, Clone)]
struct MemTable {
    shape: TableShape,
    rows: Vec<Record>,
    primary_key: Option<(String, Vec<String>)>,
}

impl MemTable {
    fn new(shape: TableShape) -> Self {
        Self {
            shape,
            rows: Vec::new(),
            primary_key: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    catalog: Arc<Mutex<Catalog>>,
    live_staging: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn has_namespace(&self, namespace: &str) -> bool {
        self.catalog.lock().await.namespaces.contains(namespace)
    }

    /// Committed rows of `table`, in insertion order.
    pub async fn rows(&self, table: &TableRef) -> Vec<Record> {
        self.catalog
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub async fn shape(&self, table: &TableRef) -> Option<TableShape> {
        self.catalog
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.shape.clone())
    }

    /// Names of the key constraints on `table`.
    pub async fn constraints(&self, table: &TableRef) -> Vec<String> {
        self.catalog
            .lock()
            .await
            .tables
            .get(table)
            .and_then(|t| t.primary_key.as_ref())
            .map(|(name, _)| vec![name.clone()])
            .unwrap_or_default()
    }

    /// Staging areas that currently exist across all sessions.
    pub fn live_staging_areas(&self) -> usize {
        self.live_staging.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let guard = Arc::clone(&self.catalog).lock_owned().await;
        let work = (*guard).clone();
        Ok(Box::new(MemorySession {
            guard: Some(guard),
            work,
            staging: BTreeMap::new(),
            live_staging: Arc::clone(&self.live_staging),
        }))
    }
}

struct MemorySession {
    guard: Option<OwnedMutexGuard<Catalog>>,
    work: Catalog,
    staging: BTreeMap<String, MemTable>,
    live_staging: Arc<AtomicUsize>,
}

impl MemorySession {
    fn table(&self, table: &TableRef) -> Result<&MemTable, StoreError> {
        self.work
            .tables
            .get(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    fn table_mut(&mut self, table: &TableRef) -> Result<&mut MemTable, StoreError> {
        self.work
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    fn staging_area(&self, name: &str) -> Result<&MemTable, StoreError> {
        self.staging
            .get(name)
            .ok_or_else(|| StoreError::MissingTable(format!("pg_temp.{name}")))
    }

    fn release_staging(&mut self) {
        let count = self.staging.len();
        self.staging.clear();
        self.live_staging.fetch_sub(count, Ordering::SeqCst);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release_staging();
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn create_namespace(&mut self, namespace: &str) -> Result<(), StoreError> {
        self.work.namespaces.insert(namespace.to_string());
        Ok(())
    }

    async fn lock_table(&mut self, _table: &TableRef) -> Result<(), StoreError> {
        // the session already holds the catalog lock
        Ok(())
    }

    async fn describe_table(&mut self, table: &TableRef) -> Result<Option<TableShape>, StoreError> {
        Ok(self.work.tables.get(table).map(|t| t.shape.clone()))
    }

    async fn create_table(&mut self, table: &TableRef, shape: &TableShape) -> Result<(), StoreError> {
        if !self.work.namespaces.contains(&table.schema) {
            return Err(StoreError::Rejected(format!(
                "schema {} does not exist",
                table.schema
            )));
        }
        self.work
            .tables
            .entry(table.clone())
            .or_insert_with(|| MemTable::new(shape.clone()));
        Ok(())
    }

    async fn constraint_exists(
        &mut self,
        table: &TableRef,
        constraint: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .table(table)?
            .primary_key
            .as_ref()
            .is_some_and(|(name, _)| name == constraint))
    }

    async fn add_primary_key(
        &mut self,
        table: &TableRef,
        constraint: &str,
        columns: &[String],
    ) -> Result<(), StoreError> {
        let target = self.table_mut(table)?;
        if target.primary_key.is_some() {
            return Err(StoreError::ConstraintRace {
                constraint: constraint.to_string(),
            });
        }
        if let Some(missing) = columns.iter().find(|c| target.shape.column(c).is_none()) {
            return Err(StoreError::Rejected(format!(
                "column {missing} does not exist on {table}"
            )));
        }

        let mut seen = HashSet::new();
        for row in &target.rows {
            let key = key_of(row, columns)?;
            if !seen.insert(key) {
                return Err(StoreError::Rejected(format!(
                    "could not create unique index {constraint}: duplicate key"
                )));
            }
        }

        target.primary_key = Some((constraint.to_string(), columns.to_vec()));
        Ok(())
    }

    async fn create_staging(
        &mut self,
        target: &TableRef,
        shape: &TableShape,
    ) -> Result<StagingHandle, StoreError> {
        self.table(target)?;
        let name = staging_name(target);
        if self
            .staging
            .insert(name.clone(), MemTable::new(shape.clone()))
            .is_none()
        {
            self.live_staging.fetch_add(1, Ordering::SeqCst);
        }
        let columns = shape.column_names().map(str::to_string).collect();
        Ok(StagingHandle::new(name, columns))
    }

    async fn insert_rows(
        &mut self,
        staging: &StagingHandle,
        shape: &TableShape,
        rows: &[Record],
    ) -> Result<u64, StoreError> {
        let area = self
            .staging
            .get_mut(staging.name())
            .ok_or_else(|| StoreError::MissingTable(format!("pg_temp.{}", staging.name())))?;
        area.rows
            .extend(rows.iter().map(|r| project(r, shape.column_names())));
        Ok(rows.len() as u64)
    }

    async fn insert_from_staging(
        &mut self,
        staging: &StagingHandle,
        target: &TableRef,
        conflict_columns: Option<&[String]>,
    ) -> Result<u64, StoreError> {
        let staged = self.staging_area(staging.name())?.rows.clone();
        let table = self.table_mut(target)?;

        let key_columns = match (&table.primary_key, conflict_columns) {
            (Some((_, pk)), Some(conflict)) if same_set(pk, conflict) => Some(pk.clone()),
            (_, Some(_)) => {
                return Err(StoreError::Rejected(
                    "there is no unique constraint matching the ON CONFLICT specification"
                        .to_string(),
                ))
            }
            (Some((_, pk)), None) => Some(pk.clone()),
            (None, None) => None,
        };

        let mut fresh = Vec::with_capacity(staged.len());
        match key_columns {
            None => fresh.extend(
                staged
                    .iter()
                    .map(|r| project(r, table.shape.column_names())),
            ),
            Some(keys) => {
                let mut existing = table
                    .rows
                    .iter()
                    .map(|r| key_of(r, &keys))
                    .collect::<Result<HashSet<_>, _>>()?;
                for row in &staged {
                    if existing.insert(key_of(row, &keys)?) {
                        fresh.push(project(row, table.shape.column_names()));
                    } else if conflict_columns.is_none() {
                        return Err(StoreError::Rejected(format!(
                            "duplicate key value violates unique constraint on {target}"
                        )));
                    }
                }
            }
        }

        let inserted = fresh.len() as u64;
        table.rows.extend(fresh);
        Ok(inserted)
    }

    async fn drop_staging(&mut self, staging: StagingHandle) -> Result<(), StoreError> {
        if self.staging.remove(staging.name()).is_some() {
            self.live_staging.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn select_all(
        &mut self,
        table: &TableRef,
        shape: &TableShape,
    ) -> Result<Vec<Record>, StoreError> {
        Ok(self
            .table(table)?
            .rows
            .iter()
            .map(|r| project(r, shape.column_names()))
            .collect())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        // temp areas are dropped on commit, like ON COMMIT DROP
        self.release_staging();
        if let Some(mut guard) = self.guard.take() {
            *guard = std::mem::take(&mut self.work);
        }
        Ok(())
    }
}

fn project<'a>(record: &Record, columns: impl Iterator<Item = &'a str>) -> Record {
    columns
        .map(|name| (name, record.get(name).cloned().unwrap_or(Value::Null)))
        .collect()
}

fn key_of(record: &Record, columns: &[String]) -> Result<Vec<Value>, StoreError> {
    columns
        .iter()
        .map(|c| match record.get(c) {
            Some(value) if !value.is_null() => Ok(value.clone()),
            _ => Err(StoreError::Rejected(format!(
                "null value in key column {c}"
            ))),
        })
        .collect()
}

fn same_set(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().all(|c| b.contains(c))
}
