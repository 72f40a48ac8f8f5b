//! In-batch deduplication on natural key.
//!
//! A batch routinely carries several rows for the same key (a user appears in
//! every event they produced). [`dedupe`] keeps exactly one winner per key
//! according to a [`TieBreakRule`]. The result is keyed by [`KeyValue`], so
//! downstream planning iterates in key order regardless of input order.

use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use stagewise_types::{KeySpec, KeyValue, StagedRow, TieBreakRule, Value};

/// Resolved batch: one row per distinct key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deduplicated {
    pub rows: BTreeMap<KeyValue, StagedRow>,
    /// Rows dropped because a key field was absent or `NULL`.
    pub skipped: usize,
}

impl Deduplicated {
    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Resolve `rows` to one winner per `key`.
///
/// Rows without a complete key are counted in [`Deduplicated::skipped`];
/// that is not an error.
pub fn dedupe<I>(rows: I, key: &KeySpec, tiebreak: &TieBreakRule) -> Deduplicated
where
    I: IntoIterator<Item = StagedRow>,
{
    let mut winners: BTreeMap<KeyValue, StagedRow> = BTreeMap::new();
    let mut skipped = 0usize;
    let mut seen = 0usize;

    for row in rows {
        seen += 1;
        let Some(key_value) = key.extract(&row) else {
            skipped += 1;
            continue;
        };
        match winners.entry(key_value) {
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
            Entry::Occupied(mut slot) => {
                if challenger_wins(tiebreak, slot.get(), &row) {
                    slot.insert(row);
                }
            }
        }
    }

    tracing::debug!(
        rows = seen,
        distinct_keys = winners.len(),
        skipped,
        "Deduplicated batch"
    );

    Deduplicated {
        rows: winners,
        skipped,
    }
}

/// Whether `challenger`, seen after `incumbent`, replaces it.
fn challenger_wins(rule: &TieBreakRule, incumbent: &StagedRow, challenger: &StagedRow) -> bool {
    match rule {
        TieBreakRule::FirstWins => false,
        // NULL sorts below every present value; equal values go to the later row.
        TieBreakRule::LatestWins { field } => challenger.get(field) >= incumbent.get(field),
        TieBreakRule::ShortestLabelWins { field } => {
            compare_labels(challenger.get(field), incumbent.get(field)) == Ordering::Less
        }
    }
}

/// Shorter labels first, then lexicographic; a missing label sorts last.
fn compare_labels(a: &Value, b: &Value) -> Ordering {
    match (label(a), label(b)) {
        (Some(a), Some(b)) => a
            .chars()
            .count()
            .cmp(&b.chars().count())
            .then_with(|| a.cmp(&b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn label(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Text(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(user: i64, ts: i64, level: &str) -> StagedRow {
        StagedRow::new()
            .with("user_id", user)
            .with("ts", ts)
            .with("level", level)
    }

    fn artist(id: &str, name: Option<&str>) -> StagedRow {
        StagedRow::new()
            .with("artist_id", id)
            .with("name", name.map(str::to_owned))
    }

    fn key(field: &str) -> KeySpec {
        KeySpec::new([field])
    }

    fn latest(field: &str) -> TieBreakRule {
        TieBreakRule::LatestWins {
            field: field.into(),
        }
    }

    fn shortest(field: &str) -> TieBreakRule {
        TieBreakRule::ShortestLabelWins {
            field: field.into(),
        }
    }

    #[test]
    fn latest_wins_keeps_maximum() {
        let rows = vec![event(1, 10, "free"), event(1, 30, "paid"), event(1, 20, "free")];
        let out = dedupe(rows, &key("user_id"), &latest("ts"));
        assert_eq!(out.len(), 1);
        let winner = out.rows.values().next().unwrap();
        assert_eq!(winner.get("level"), &Value::from("paid"));
    }

    #[test]
    fn latest_wins_exact_tie_goes_to_last_occurrence() {
        let rows = vec![event(1, 10, "free"), event(1, 10, "paid")];
        let out = dedupe(rows, &key("user_id"), &latest("ts"));
        assert_eq!(out.rows.values().next().unwrap().get("level"), &Value::from("paid"));
    }

    #[test]
    fn latest_wins_missing_ordering_value_loses() {
        let undated = StagedRow::new().with("user_id", 1).with("level", "paid");
        let rows = vec![event(1, 5, "free"), undated];
        let out = dedupe(rows, &key("user_id"), &latest("ts"));
        assert_eq!(out.rows.values().next().unwrap().get("level"), &Value::from("free"));
    }

    #[test]
    fn shortest_label_wins_then_lexicographic() {
        let rows = vec![
            artist("A1", Some("The Beatles")),
            artist("A1", Some("Beatles")),
            artist("A1", Some("Abbeyys")),
        ];
        let out = dedupe(rows, &key("artist_id"), &shortest("name"));
        assert_eq!(out.rows.values().next().unwrap().get("name"), &Value::from("Abbeyys"));
    }

    #[test]
    fn shortest_label_counts_characters_not_bytes() {
        // Both are six bytes; only the character count separates them.
        let rows = vec![artist("A1", Some("Bjorks")), artist("A1", Some("Björk"))];
        let out = dedupe(rows, &key("artist_id"), &shortest("name"));
        assert_eq!(out.rows.values().next().unwrap().get("name"), &Value::from("Björk"));
    }

    #[test]
    fn shortest_label_missing_label_sorts_last() {
        let rows = vec![artist("A1", None), artist("A1", Some("A much longer name"))];
        let out = dedupe(rows, &key("artist_id"), &shortest("name"));
        assert_eq!(
            out.rows.values().next().unwrap().get("name"),
            &Value::from("A much longer name")
        );
    }

    #[test]
    fn first_wins_keeps_first_occurrence() {
        let rows = vec![event(1, 10, "free"), event(1, 99, "paid")];
        let out = dedupe(rows, &key("user_id"), &TieBreakRule::FirstWins);
        assert_eq!(out.rows.values().next().unwrap().get("level"), &Value::from("free"));
    }

    #[test]
    fn rows_without_key_are_skipped() {
        let anonymous = StagedRow::new().with("ts", 1).with("level", "free");
        let null_key = StagedRow::new().with("user_id", Value::Null).with("ts", 2);
        let rows = vec![anonymous, event(2, 1, "free"), null_key];
        let out = dedupe(rows, &key("user_id"), &latest("ts"));
        assert_eq!(out.len(), 1);
        assert_eq!(out.skipped, 2);
    }

    #[test]
    fn composite_keys_resolve_independently() {
        let spec = KeySpec::new(["session", "ts"]);
        let rows = vec![
            StagedRow::new().with("session", 1).with("ts", 1).with("n", 1),
            StagedRow::new().with("session", 1).with("ts", 2).with("n", 2),
            StagedRow::new().with("session", 1).with("ts", 1).with("n", 3),
        ];
        let out = dedupe(rows, &spec, &TieBreakRule::FirstWins);
        assert_eq!(out.len(), 2);
        let first = out
            .rows
            .get(&KeyValue::new(vec![Value::Int(1), Value::Int(1)]))
            .unwrap();
        assert_eq!(first.get("n"), &Value::Int(1));
    }

    #[test]
    fn empty_input_resolves_to_empty_set() {
        let out = dedupe(Vec::new(), &key("user_id"), &latest("ts"));
        assert!(out.is_empty());
        assert_eq!(out.skipped, 0);
    }
}
