//! Record sources feeding the raw landing layer.

use async_trait::async_trait;
use bronze_core::{Column, ColumnType, Record, TableShape};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "bronze-source";

pub const DEFAULT_SEED: u64 = 42;

/// Columns produced by [`SyntheticOrders`], in order.
pub const ORDER_COLUMNS: [&str; 8] = [
    "col1_bk", "col2_bk", "col3_fk", "col4_fk", "col5", "col6", "col7", "col8",
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {source_id} is unavailable: {reason}")]
    Unavailable { source_id: String, reason: String },
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Shape every fetched record conforms to.
    fn shape(&self) -> TableShape;

    async fn fetch(&self, row_count: usize) -> Result<Vec<Record>, SourceError>;
}

/// Seeded order generator; the same seed yields the same records on every fetch.
#[derive(Debug, Clone)]
pub struct SyntheticOrders {
    seed: u64,
}

impl SyntheticOrders {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn generate(&self, row_count: usize) -> Vec<Record> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        (0..row_count).map(|i| order(&mut rng, i)).collect()
    }
}

impl Default for SyntheticOrders {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

#[async_trait]
impl RecordSource for SyntheticOrders {
    fn source_id(&self) -> &str {
        "synthetic-orders"
    }

    fn shape(&self) -> TableShape {
        TableShape::new(
            ORDER_COLUMNS
                .iter()
                .map(|name| Column::new(*name, ColumnType::Text))
                .collect(),
        )
    }

    async fn fetch(&self, row_count: usize) -> Result<Vec<Record>, SourceError> {
        let records = self.generate(row_count);
        debug!(seed = self.seed, rows = records.len(), "generated synthetic orders");
        Ok(records)
    }
}

fn order(rng: &mut StdRng, index: usize) -> Record {
    let col2 = format!("SRC-{}", rng.gen_range(1..=5));
    let col3 = present(rng, 0.1).then(|| format!("HUB-{}", rng.gen_range(100..=999)));
    let col4 = present(rng, 0.2).then(|| format!("HUB-{}", rng.gen_range(1000..=1999)));
    let col5 = alphanumeric(rng, 10);
    let col6 = rng.gen_range(0..=10_000).to_string();
    let col7 = present(rng, 0.3).then(|| alphanumeric(rng, 5));
    let col8 = present(rng, 0.5).then(|| alphanumeric(rng, 12));

    Record::new()
        .with("col1_bk", format!("CUST-{index:06}"))
        .with("col2_bk", col2)
        .with("col3_fk", col3)
        .with("col4_fk", col4)
        .with("col5", col5)
        .with("col6", col6)
        .with("col7", col7)
        .with("col8", col8)
}

fn present(rng: &mut StdRng, null_ratio: f64) -> bool {
    rng.gen::<f64>() >= null_ratio
}

fn alphanumeric(rng: &mut StdRng, len: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
