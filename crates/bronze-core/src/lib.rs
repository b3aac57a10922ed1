//! Record model, value normalization and content hashing for the bronze landing layers.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "bronze-core";

/// Token standing in for null, empty and whitespace-only values.
///
/// Normalized real values never contain control characters, so this can never
/// collide with a legitimate string such as `"NULL"`.
pub const NULL_TOKEN: &str = "\u{0}NULL\u{0}";

/// Joins normalized tokens before hashing (ASCII unit separator).
pub const FIELD_SEPARATOR: &str = "\u{1f}";

pub const BK_HASH_COLUMN: &str = "bk_hash";
pub const ROW_HASH_COLUMN: &str = "row_hash";
pub const LOAD_TIMESTAMP_COLUMN: &str = "load_dts";
pub const RECORD_SOURCE_COLUMN: &str = "record_source";

/// Identity of a row in the hashed layer.
pub const HASH_IDENTITY_COLUMNS: [&str; 2] = [BK_HASH_COLUMN, ROW_HASH_COLUMN];

pub const DEFAULT_BUSINESS_KEY: [&str; 2] = ["col1_bk", "col2_bk"];
pub const DEFAULT_ATTRIBUTES: [&str; 6] = ["col3_fk", "col4_fk", "col5", "col6", "col7", "col8"];

/// Scalar cell value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ColumnType {
    Text,
    BigInt,
    TimestampTz,
}

impl ColumnType {
    /// Column type a non-null value would infer; `None` for null.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Int(_) => Some(ColumnType::BigInt),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Timestamp(_) => Some(ColumnType::TimestampTz),
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        match Self::of(value) {
            None => true,
            Some(kind) => kind == self,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeViolation {
    #[error("record is missing column {0}")]
    MissingColumn(String),
    #[error("record carries unexpected column {0}")]
    UnexpectedColumn(String),
    #[error("column {column} expects {expected:?} values")]
    TypeMismatch { column: String, expected: ColumnType },
}

/// Ordered column layout shared by a batch, its staging area and its target table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TableShape {
    columns: Vec<Column>,
}

impl TableShape {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Column order comes from the first record; each type from the first non-null
    /// value in that column, `Text` when the column is entirely null.
    pub fn infer(records: &[Record]) -> Option<Self> {
        let first = records.first()?;
        let columns = first
            .iter()
            .map(|(name, _)| {
                let column_type = records
                    .iter()
                    .filter_map(|r| r.get(name))
                    .find_map(ColumnType::of)
                    .unwrap_or(ColumnType::Text);
                Column::new(name.clone(), column_type)
            })
            .collect();
        Some(Self { columns })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Shape of [`HashedRecord::into_record`] rows built from records of this shape.
    pub fn with_hash_columns(&self) -> TableShape {
        let mut columns = self.columns.clone();
        columns.extend([
            Column::new(BK_HASH_COLUMN, ColumnType::Text),
            Column::new(ROW_HASH_COLUMN, ColumnType::Text),
            Column::new(LOAD_TIMESTAMP_COLUMN, ColumnType::TimestampTz),
            Column::new(RECORD_SOURCE_COLUMN, ColumnType::Text),
        ]);
        TableShape::new(columns)
    }

    pub fn validate(&self, record: &Record) -> Result<(), ShapeViolation> {
        for column in &self.columns {
            let value = record
                .get(&column.name)
                .ok_or_else(|| ShapeViolation::MissingColumn(column.name.clone()))?;
            if !column.column_type.accepts(value) {
                return Err(ShapeViolation::TypeMismatch {
                    column: column.name.clone(),
                    expected: column.column_type,
                });
            }
        }
        if let Some((name, _)) = record.iter().find(|(name, _)| self.column(name).is_none()) {
            return Err(ShapeViolation::UnexpectedColumn(name.clone()));
        }
        Ok(())
    }
}

/// Ordered mapping of column names to values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Replaces the value in place when the column exists, appends otherwise.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter().map(|(n, v)| (n, v))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<N: Into<String>, V: Into<Value>> FromIterator<(N, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (name, value) in iter {
            record.set(name, value);
        }
        record
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self::new(self.schema.clone(), format!("{}{suffix}", self.name))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Canonical token for hashing: trimmed, whitespace-collapsed, uppercased.
pub fn normalize(value: &Value) -> String {
    let rendered: Cow<'_, str> = match value {
        Value::Null => return NULL_TOKEN.to_string(),
        Value::Text(s) => Cow::Borrowed(s.as_str()),
        Value::Int(v) => Cow::Owned(v.to_string()),
        Value::Timestamp(ts) => Cow::Owned(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
    };

    let collapsed = rendered
        .split(|c: char| c.is_whitespace() || c.is_control())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    if collapsed.is_empty() {
        NULL_TOKEN.to_string()
    } else {
        collapsed.to_uppercase()
    }
}

/// SHA-256 over the normalized, separator-joined values, as lowercase hex.
pub fn digest<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut hasher = Sha256::new();
    for (idx, value) in values.into_iter().enumerate() {
        if idx > 0 {
            hasher.update(FIELD_SEPARATOR.as_bytes());
        }
        hasher.update(normalize(value).as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HashSpecError {
    #[error("business key must name at least one column")]
    EmptyBusinessKey,
    #[error("column {0} is declared more than once")]
    DuplicateColumn(String),
    #[error("column {0} collides with a derived column")]
    ReservedColumn(String),
}

/// Column orders feeding `bk_hash` and `row_hash` for one entity type.
///
/// The business key is hashed in declaration order; the row hash covers the
/// business key followed by the attributes. Reordering either list changes every
/// digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashSpec {
    business_key: Vec<String>,
    attributes: Vec<String>,
}

impl HashSpec {
    pub fn new<B, A>(business_key: B, attributes: A) -> Result<Self, HashSpecError>
    where
        B: IntoIterator,
        B::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        let business_key: Vec<String> = business_key.into_iter().map(Into::into).collect();
        let attributes: Vec<String> = attributes.into_iter().map(Into::into).collect();
        if business_key.is_empty() {
            return Err(HashSpecError::EmptyBusinessKey);
        }

        let reserved = [
            BK_HASH_COLUMN,
            ROW_HASH_COLUMN,
            LOAD_TIMESTAMP_COLUMN,
            RECORD_SOURCE_COLUMN,
        ];
        let mut seen = std::collections::HashSet::new();
        for column in business_key.iter().chain(attributes.iter()) {
            if reserved.contains(&column.as_str()) {
                return Err(HashSpecError::ReservedColumn(column.clone()));
            }
            if !seen.insert(column.as_str()) {
                return Err(HashSpecError::DuplicateColumn(column.clone()));
            }
        }

        Ok(Self {
            business_key,
            attributes,
        })
    }

    pub fn business_key(&self) -> &[String] {
        &self.business_key
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn row_columns(&self) -> impl Iterator<Item = &String> {
        self.business_key.iter().chain(self.attributes.iter())
    }
}

impl Default for HashSpec {
    fn default() -> Self {
        Self {
            business_key: DEFAULT_BUSINESS_KEY.iter().map(|c| c.to_string()).collect(),
            attributes: DEFAULT_ATTRIBUTES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnrichError {
    #[error("record has no column {0} declared in the hash spec")]
    MissingColumn(String),
}

/// Raw record plus identity hashes and load metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashedRecord {
    pub raw: Record,
    pub bk_hash: String,
    pub row_hash: String,
    pub load_timestamp: DateTime<Utc>,
    pub record_source: String,
}

impl HashedRecord {
    /// Flattened row: raw columns, then `bk_hash`, `row_hash`, `load_dts`, `record_source`.
    pub fn into_record(self) -> Record {
        self.raw
            .with(BK_HASH_COLUMN, self.bk_hash)
            .with(ROW_HASH_COLUMN, self.row_hash)
            .with(LOAD_TIMESTAMP_COLUMN, self.load_timestamp)
            .with(RECORD_SOURCE_COLUMN, self.record_source)
    }
}

pub fn enrich(
    raw: &Record,
    spec: &HashSpec,
    record_source: &str,
    now: DateTime<Utc>,
) -> Result<HashedRecord, EnrichError> {
    let lookup = |column: &String| {
        raw.get(column)
            .ok_or_else(|| EnrichError::MissingColumn(column.clone()))
    };
    let bk_values = spec
        .business_key()
        .iter()
        .map(lookup)
        .collect::<Result<Vec<_>, _>>()?;
    let row_values = spec.row_columns().map(lookup).collect::<Result<Vec<_>, _>>()?;

    Ok(HashedRecord {
        raw: raw.clone(),
        bk_hash: digest(bk_values),
        row_hash: digest(row_values),
        load_timestamp: now,
        record_source: record_source.to_string(),
    })
}

/// Enriches a whole batch with one shared load timestamp.
pub fn enrich_batch(
    records: &[Record],
    spec: &HashSpec,
    record_source: &str,
    now: DateTime<Utc>,
) -> Result<Vec<HashedRecord>, EnrichError> {
    records
        .iter()
        .map(|r| enrich(r, spec, record_source, now))
        .collect()
}
