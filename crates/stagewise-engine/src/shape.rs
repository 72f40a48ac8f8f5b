//! Row shaping: from staging rows to target rows.
//!
//! A load stage reads its staging table and derives each target column from
//! a [`ColumnSource`]. Target columns without an explicit source copy the
//! staging field of the same name. The shaped row keeps every staging field
//! underneath the derived ones, so tie-break fields that are not target
//! columns (an event timestamp, say) stay available to the deduplicator.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stagewise_store::TargetStore;
use stagewise_types::{StageError, StagedRow, TargetTableSpec, Value};

use crate::render;

/// Format of timestamps derived from epoch milliseconds.
pub const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Separator placed between hashed fields so `("ab", "c")` and `("a", "bc")`
/// produce different digests.
const HASH_FIELD_SEPARATOR: char = '\u{1f}';

/// Where a target column's value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnSource {
    /// Copy a staging field.
    Field(String),
    Derived(Derivation),
}

/// Computed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Derivation {
    /// Epoch milliseconds rendered as a UTC timestamp.
    EpochMillis { field: String },
    /// One calendar component of an epoch-milliseconds field.
    TimePart { field: String, part: TimePart },
    /// Hex SHA-256 over the listed fields: a deterministic surrogate key.
    Hash { fields: Vec<String> },
    /// Value of `select` from the first row of `table` matching every
    /// `on` pair (`table column -> staging field`) after normalization.
    Lookup {
        table: String,
        on: BTreeMap<String, String>,
        select: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePart {
    Hour,
    Day,
    Week,
    Month,
    Year,
    /// 1 = Sunday through 7 = Saturday.
    Weekday,
}

impl TimePart {
    fn extract(self, ts: &DateTime<Utc>) -> i64 {
        let n = match self {
            Self::Hour => ts.hour(),
            Self::Day => ts.day(),
            Self::Week => ts.iso_week().week(),
            Self::Month => ts.month(),
            Self::Year => return i64::from(ts.year()),
            Self::Weekday => ts.weekday().number_from_sunday(),
        };
        i64::from(n)
    }
}

/// Declarative shaping of one load stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowShape {
    /// Equality predicates applied when reading the staging table.
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    /// Target column to source; unlisted columns copy the same-named field.
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnSource>,
}

impl RowShape {
    /// Tables read by `lookup` columns.
    pub fn lookup_tables(&self) -> impl Iterator<Item = &str> {
        self.columns.values().filter_map(|source| match source {
            ColumnSource::Derived(Derivation::Lookup { table, .. }) => Some(table.as_str()),
            _ => None,
        })
    }
}

/// Lookup-match normal form: trimmed upper-case text, truncated numbers.
fn normalize(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(i64::from(*b).to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(format!("{}", f.trunc())),
        Value::Text(s) => Some(s.trim().to_uppercase()),
    }
}

/// Index over one lookup table: normalized `on` tuple to selected value.
#[derive(Debug, Default)]
struct LookupIndex {
    entries: HashMap<Vec<String>, Value>,
}

/// A [`RowShape`] with its lookup tables loaded.
#[derive(Debug)]
pub struct RowShaper {
    shape: RowShape,
    /// Keyed by target column.
    lookups: BTreeMap<String, LookupIndex>,
}

impl RowShaper {
    /// Load every lookup table the shape references.
    ///
    /// # Errors
    ///
    /// Returns a transaction [`StageError`] if a lookup table cannot be read.
    pub fn prepare(shape: &RowShape, store: &dyn TargetStore) -> Result<Self, StageError> {
        let mut lookups = BTreeMap::new();
        for (column, source) in &shape.columns {
            let ColumnSource::Derived(Derivation::Lookup { table, on, select }) = source else {
                continue;
            };
            let mut columns: Vec<String> = on.keys().cloned().collect();
            columns.push(select.clone());
            let result = store
                .query(&render::select_columns(table, &columns))
                .map_err(|e| {
                    StageError::transaction(format!("reading lookup table '{table}': {e}"))
                })?;

            let mut index = LookupIndex::default();
            for row in result.rows {
                let Some((selected, key_cells)) = row.split_last() else {
                    continue;
                };
                let key: Option<Vec<String>> = key_cells.iter().map(normalize).collect();
                if let Some(key) = key {
                    index.entries.entry(key).or_insert_with(|| selected.clone());
                }
            }
            tracing::debug!(column, table, entries = index.entries.len(), "Loaded lookup");
            lookups.insert(column.clone(), index);
        }
        Ok(Self {
            shape: shape.clone(),
            lookups,
        })
    }

    #[must_use]
    pub fn shape(&self) -> &RowShape {
        &self.shape
    }

    /// Derive the target columns of `target` from one staging row.
    #[must_use]
    pub fn apply(&self, row: StagedRow, target: &TargetTableSpec) -> StagedRow {
        let derived: Vec<(String, Value)> = target
            .fields
            .iter()
            .map(|field| (field.clone(), self.column_value(field, &row)))
            .collect();
        let mut shaped = row;
        for (field, value) in derived {
            shaped.insert(field, value);
        }
        shaped
    }

    fn column_value(&self, column: &str, row: &StagedRow) -> Value {
        match self.shape.columns.get(column) {
            None => row.get(column).clone(),
            Some(ColumnSource::Field(field)) => row.get(field).clone(),
            Some(ColumnSource::Derived(derivation)) => match derivation {
                Derivation::EpochMillis { field } => epoch_millis(row.get(field))
                    .map_or(Value::Null, |ts| Value::Text(ts.format(TIMESTAMP_FMT).to_string())),
                Derivation::TimePart { field, part } => {
                    epoch_millis(row.get(field)).map_or(Value::Null, |ts| Value::Int(part.extract(&ts)))
                }
                Derivation::Hash { fields } => hash_fields(row, fields),
                Derivation::Lookup { on, .. } => {
                    let key: Option<Vec<String>> =
                        on.values().map(|field| normalize(row.get(field))).collect();
                    key.and_then(|key| self.lookups.get(column)?.entries.get(&key).cloned())
                        .unwrap_or(Value::Null)
                }
            },
        }
    }
}

fn epoch_millis(value: &Value) -> Option<DateTime<Utc>> {
    value.as_i64().and_then(DateTime::from_timestamp_millis)
}

fn hash_fields(row: &StagedRow, fields: &[String]) -> Value {
    if fields.iter().any(|f| row.get(f).is_null()) {
        return Value::Null;
    }
    let mut hasher = Sha256::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            let mut buf = [0u8; 4];
            hasher.update(HASH_FIELD_SEPARATOR.encode_utf8(&mut buf).as_bytes());
        }
        hasher.update(row.get(field).to_string().as_bytes());
    }
    Value::Text(format!("{:x}", hasher.finalize()))
}
