//! Cell values, staged rows and natural-key tuples.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single cell value as it travels from a row source into a target table.
///
/// Values are totally ordered so that key tuples can live in ordered maps and
/// tie-break rules can compare ordering fields. Cross-type ordering is
/// `Null < Bool < number < Text`; integers and floats compare numerically, so
/// `Int(1)` and `Float(1.0)` are the same key, matching SQL equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of the value. Numeric text is parsed; everything else is `None`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Null | Self::Bool(_) => None,
        }
    }

    /// Integer view of the value. Floats are truncated, numeric text is parsed.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            Self::Text(s) => {
                let trimmed = s.trim();
                trimmed
                    .parse::<i64>()
                    .ok()
                    .or_else(|| trimmed.parse::<f64>().ok().map(|f| f.trunc() as i64))
            }
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 2,
            Self::Text(_) => 3,
        }
    }

    /// Total order over values, see the type-level docs.
    #[must_use]
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => cmp_floats(*a, *b),
            (Self::Int(a), Self::Float(b)) => cmp_int_float(*a, *b),
            (Self::Float(a), Self::Int(b)) => cmp_int_float(*b, *a).reverse(),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// `-0.0 == 0.0` like SQL; NaNs sort outside every number by sign.
fn cmp_floats(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or_else(|| a.total_cmp(&b))
}

/// Exact comparison of an integer with a float, without rounding `i` to `f64`.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    // 2^63 is exactly representable; every i64 lies in [-2^63, 2^63).
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if f.is_nan() {
        return if f.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if f >= TWO_POW_63 {
        return Ordering::Less;
    }
    if f < -TWO_POW_63 {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    i.cmp(&(whole as i64)).then_with(|| {
        let frac = f - whole;
        if frac > 0.0 {
            Ordering::Less
        } else if frac < 0.0 {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    })
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    /// Nested arrays and objects are kept as their JSON text.
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or_else(|| Self::Text(n.to_string())),
            serde_json::Value::String(s) => Self::Text(s),
            other @ (serde_json::Value::Array(_) | serde_json::Value::Object(_)) => {
                Self::Text(other.to_string())
            }
        }
    }
}

/// One raw row: field name to value.
///
/// Missing fields and explicit `NULL`s are indistinguishable to consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StagedRow(BTreeMap<String, Value>);

impl StagedRow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `field`, treating absent fields as `NULL`.
    #[must_use]
    pub fn get(&self, field: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.0.get(field).unwrap_or(&NULL)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Values for `fields` in order, `NULL` where absent.
    #[must_use]
    pub fn project(&self, fields: &[String]) -> Vec<Value> {
        fields.iter().map(|f| self.get(f).clone()).collect()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for StagedRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl TryFrom<serde_json::Value> for StagedRow {
    type Error = String;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        match value {
            serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(format!("expected a JSON object, got {other}")),
        }
    }
}

/// The tuple of natural-key values identifying one logical entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyValue(Vec<Value>);

impl KeyValue {
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_type_ordering_is_total() {
        let mut values = vec![
            Value::from("b"),
            Value::Int(3),
            Value::Null,
            Value::Float(2.5),
            Value::Bool(true),
            Value::from("a"),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(true),
                Value::Float(2.5),
                Value::Int(3),
                Value::from("a"),
                Value::from("b"),
            ]
        );
    }

    #[test]
    fn int_and_float_compare_numerically() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert!(Value::Int(1) < Value::Float(1.5));
    }

    #[test]
    fn int_float_comparison_is_exact_beyond_f64_precision() {
        let big = 1_i64 << 53;
        assert!(Value::Int(big + 1) > Value::Float(9_007_199_254_740_992.0));
        assert_eq!(Value::Int(big), Value::Float(9_007_199_254_740_992.0));
        assert!(Value::Int(i64::MAX) < Value::Float(9_223_372_036_854_775_808.0));
        assert!(Value::Int(-3) > Value::Float(-3.5));
        assert_eq!(Value::Float(-0.0), Value::Int(0));
        assert_eq!(Value::Float(-0.0), Value::Float(0.0));
        assert!(Value::Float(f64::NAN) > Value::Int(i64::MAX));
    }

    #[test]
    fn json_conversion_keeps_scalars_and_stringifies_nested() {
        assert_eq!(Value::from(serde_json::json!(7)), Value::Int(7));
        assert_eq!(Value::from(serde_json::json!(1.5)), Value::Float(1.5));
        assert_eq!(Value::from(serde_json::json!(null)), Value::Null);
        assert_eq!(
            Value::from(serde_json::json!([1, 2])),
            Value::from("[1,2]")
        );
    }

    #[test]
    fn staged_row_treats_missing_as_null() {
        let row = StagedRow::new().with("id", 1_i64);
        assert_eq!(row.get("id"), &Value::Int(1));
        assert!(row.get("nope").is_null());
        assert_eq!(
            row.project(&["id".to_string(), "nope".to_string()]),
            vec![Value::Int(1), Value::Null]
        );
    }

    #[test]
    fn staged_row_from_json_object_only() {
        let row = StagedRow::try_from(serde_json::json!({"a": "x", "b": 2})).unwrap();
        assert_eq!(row.get("a"), &Value::from("x"));
        assert!(StagedRow::try_from(serde_json::json!([1])).is_err());
    }

    #[test]
    fn numeric_views() {
        assert_eq!(Value::from("42").as_i64(), Some(42));
        assert_eq!(Value::Float(3.9).as_i64(), Some(3));
        assert_eq!(Value::from(" 2.5 ").as_f64(), Some(2.5));
        assert_eq!(Value::Null.as_f64(), None);
    }

    #[test]
    fn yaml_style_untagged_deserialization() {
        let v: Value = serde_json::from_str("\"NextSong\"").unwrap();
        assert_eq!(v, Value::from("NextSong"));
        let v: Value = serde_json::from_str("10").unwrap();
        assert!(matches!(v, Value::Int(10)));
        let v: Value = serde_json::from_str("null").unwrap();
        assert!(v.is_null());
    }

    #[test]
    fn key_value_display() {
        let key = KeyValue::new(vec![Value::from("k1"), Value::Int(2)]);
        assert_eq!(key.to_string(), "(k1, 2)");
    }
}
