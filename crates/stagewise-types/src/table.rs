//! Target table descriptors, insert modes and tie-break rules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::value::{KeyValue, StagedRow};

/// How a resolved batch is merged into its target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertMode {
    /// Insert only keys absent from the target; existing rows are untouched.
    Append,
    /// Truncate the target, then insert the batch. Full refresh.
    #[serde(alias = "full_refresh")]
    InsertDelete,
    /// Update rows whose key already exists, then insert absent keys.
    AppendUpdate,
}

impl InsertMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::InsertDelete => "insert_delete",
            Self::AppendUpdate => "append_update",
        }
    }
}

impl fmt::Display for InsertMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InsertMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "append" => Ok(Self::Append),
            "insert_delete" | "full_refresh" => Ok(Self::InsertDelete),
            "append_update" => Ok(Self::AppendUpdate),
            other => Err(ConfigurationError::new(format!(
                "unknown insert mode '{other}', expected append, insert_delete or append_update"
            ))),
        }
    }
}

/// Ordered natural-key field list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySpec(Vec<String>);

impl KeySpec {
    #[must_use]
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.0
    }

    /// Key tuple of `row`, or `None` when any key field is absent or `NULL`.
    #[must_use]
    pub fn extract(&self, row: &StagedRow) -> Option<KeyValue> {
        let mut values = Vec::with_capacity(self.0.len());
        for field in &self.0 {
            let value = row.get(field);
            if value.is_null() {
                return None;
            }
            values.push(value.clone());
        }
        Some(KeyValue::new(values))
    }
}

/// Rule choosing one winner among rows sharing a natural key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakRule {
    /// Maximum value of `field` wins; exact ties go to the last occurrence.
    LatestWins { field: String },
    /// Fewest characters in `field` wins; ties go to the lexicographically smallest.
    ShortestLabelWins { field: String },
    /// First occurrence in input order wins.
    #[default]
    FirstWins,
}

impl TieBreakRule {
    /// The row field the rule reads, if any.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::LatestWins { field } | Self::ShortestLabelWins { field } => Some(field),
            Self::FirstWins => None,
        }
    }
}

/// Static descriptor of a dimension or fact table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetTableSpec {
    pub name: String,
    pub fields: Vec<String>,
    pub primary_key: Vec<String>,
    pub mode: InsertMode,
    /// Fields rewritten for existing keys in `append_update` mode.
    /// Empty means every non-key field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update_fields: Vec<String>,
}

impl TargetTableSpec {
    #[must_use]
    pub fn key(&self) -> KeySpec {
        KeySpec::new(self.primary_key.iter().cloned())
    }

    #[must_use]
    pub fn effective_update_fields(&self) -> Vec<String> {
        if self.update_fields.is_empty() {
            self.fields
                .iter()
                .filter(|f| !self.primary_key.contains(*f))
                .cloned()
                .collect()
        } else {
            self.update_fields.clone()
        }
    }

    /// Check the descriptor is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] listing every problem found.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("table name must not be empty".to_string());
        }
        if self.fields.is_empty() {
            errors.push(format!("table '{}' must declare at least one field", self.name));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.trim().is_empty() {
                errors.push(format!("table '{}' field {i} has an empty name", self.name));
            } else if self.fields[..i].contains(field) {
                errors.push(format!("table '{}' declares field '{field}' twice", self.name));
            }
        }
        if self.primary_key.is_empty() {
            errors.push(format!("table '{}' must declare a primary_key", self.name));
        }
        for key in &self.primary_key {
            if !self.fields.contains(key) {
                errors.push(format!(
                    "table '{}' primary_key field '{key}' is not in its field list",
                    self.name
                ));
            }
        }
        for field in &self.update_fields {
            if !self.fields.contains(field) {
                errors.push(format!(
                    "table '{}' update field '{field}' is not in its field list",
                    self.name
                ));
            } else if self.primary_key.contains(field) {
                errors.push(format!(
                    "table '{}' update field '{field}' is part of the primary_key",
                    self.name
                ));
            }
        }
        if self.mode == InsertMode::AppendUpdate && self.effective_update_fields().is_empty() {
            errors.push(format!(
                "table '{}' uses append_update but has no updatable fields",
                self.name
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError::new(errors.join("; ")))
        }
    }
}
