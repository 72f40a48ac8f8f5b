//! Post-load data quality check definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A typed, read-only rule evaluated against current target state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QualityCheck {
    /// Passes iff the table holds at least one row.
    #[serde(alias = "fill")]
    RowCount { table: String },
    /// Passes iff the number of duplicated key values equals `expected_duplicates`.
    #[serde(alias = "double")]
    Uniqueness {
        table: String,
        key: Vec<String>,
        #[serde(default, alias = "exp_res")]
        expected_duplicates: i64,
    },
    /// Passes iff no row has `NULL` in `field`.
    NotNull { table: String, field: String },
    /// Passes iff the scalar returned by `sql` equals `expected`.
    Custom {
        name: String,
        sql: String,
        expected: i64,
    },
}

impl QualityCheck {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RowCount { .. } => "row_count",
            Self::Uniqueness { .. } => "uniqueness",
            Self::NotNull { .. } => "not_null",
            Self::Custom { .. } => "custom",
        }
    }

    /// Table or check name used in ids and log lines.
    #[must_use]
    pub fn subject(&self) -> &str {
        match self {
            Self::RowCount { table }
            | Self::Uniqueness { table, .. }
            | Self::NotNull { table, .. } => table,
            Self::Custom { name, .. } => name,
        }
    }

    fn validate(&self) -> Result<(), String> {
        let non_empty = |what: &str, value: &str| {
            if value.trim().is_empty() {
                Err(format!("{} check: {what} must not be empty", self.kind()))
            } else {
                Ok(())
            }
        };
        match self {
            Self::RowCount { table } => non_empty("table", table),
            Self::Uniqueness { table, key, .. } => {
                non_empty("table", table)?;
                if key.is_empty() {
                    return Err("uniqueness check: key must name at least one field".into());
                }
                key.iter().try_for_each(|k| non_empty("key field", k))
            }
            Self::NotNull { table, field } => {
                non_empty("table", table)?;
                non_empty("field", field)
            }
            Self::Custom { name, sql, .. } => {
                non_empty("name", name)?;
                non_empty("sql", sql)
            }
        }
    }
}

/// A check exactly as it appeared in the pipeline definition.
///
/// Kept untyped until the gate runs so that one malformed entry is reported
/// as skipped instead of rejecting the whole gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckDefinition(serde_json::Value);

impl CheckDefinition {
    #[must_use]
    pub fn new(raw: serde_json::Value) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(&self) -> &serde_json::Value {
        &self.0
    }

    /// The declared `type`, if present.
    #[must_use]
    pub fn declared_type(&self) -> Option<&str> {
        self.0.get("type").and_then(serde_json::Value::as_str)
    }

    /// Parse and validate into a [`QualityCheck`].
    ///
    /// # Errors
    ///
    /// Returns a description of why the definition is unusable: unknown
    /// `type`, missing fields, or empty names.
    pub fn compile(&self) -> Result<QualityCheck, String> {
        let check: QualityCheck = serde_json::from_value(self.0.clone()).map_err(|e| {
            match self.declared_type() {
                Some(kind) => format!("invalid '{kind}' check definition: {e}"),
                None => format!("check definition has no 'type': {e}"),
            }
        })?;
        check.validate()?;
        Ok(check)
    }
}

impl From<QualityCheck> for CheckDefinition {
    fn from(check: QualityCheck) -> Self {
        // Serializing a plain enum of strings and integers cannot fail.
        Self(serde_json::to_value(check).unwrap_or(serde_json::Value::Null))
    }
}

/// Stable identifier of one check within a gate: position, kind and subject.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckId(String);

impl CheckId {
    #[must_use]
    pub fn new(index: usize, kind: &str, subject: &str) -> Self {
        Self(format!("{index:03}:{kind}:{subject}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compiles_typed_definitions() {
        let def = CheckDefinition::new(json!({"type": "row_count", "table": "users"}));
        assert_eq!(
            def.compile().unwrap(),
            QualityCheck::RowCount {
                table: "users".into()
            }
        );

        let def = CheckDefinition::new(json!({
            "type": "uniqueness", "table": "users", "key": ["user_id"]
        }));
        assert!(matches!(
            def.compile().unwrap(),
            QualityCheck::Uniqueness {
                expected_duplicates: 0,
                ..
            }
        ));
    }

    #[test]
    fn accepts_legacy_fill_and_double_names() {
        let def = CheckDefinition::new(json!({"type": "fill", "table": "songs"}));
        assert_eq!(def.compile().unwrap().kind(), "row_count");

        let def = CheckDefinition::new(json!({
            "type": "double", "table": "songs", "key": ["song_id"], "exp_res": 0
        }));
        assert_eq!(def.compile().unwrap().kind(), "uniqueness");
    }

    #[test]
    fn unknown_type_is_described() {
        let def = CheckDefinition::new(json!({"type": "freshness", "table": "songs"}));
        let err = def.compile().unwrap_err();
        assert!(err.contains("'freshness'"), "got: {err}");
    }

    #[test]
    fn missing_type_is_described() {
        let def = CheckDefinition::new(json!({"table": "songs"}));
        assert!(def.compile().unwrap_err().contains("no 'type'"));
    }

    #[test]
    fn empty_names_rejected() {
        let def = CheckDefinition::new(json!({"type": "uniqueness", "table": "t", "key": []}));
        assert!(def.compile().is_err());
        let def = CheckDefinition::new(json!({"type": "row_count", "table": " "}));
        assert!(def.compile().is_err());
    }

    #[test]
    fn check_ids_sort_by_position() {
        let a = CheckId::new(2, "row_count", "users");
        let b = CheckId::new(10, "row_count", "artists");
        assert!(a < b);
        assert_eq!(a.as_str(), "002:row_count:users");
    }

    #[test]
    fn typed_check_round_trips_through_definition() {
        let check = QualityCheck::NotNull {
            table: "songplays".into(),
            field: "start_time".into(),
        };
        let def = CheckDefinition::from(check.clone());
        assert_eq!(def.compile().unwrap(), check);
    }
}
