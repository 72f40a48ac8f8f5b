//! SQL rendering for the `SQLite` target dialect.
//!
//! Every identifier is double-quoted; every value is a bound parameter.

use std::collections::BTreeMap;

use stagewise_store::Statement;
use stagewise_types::Value;

use crate::plan::{MergeStep, ScratchTable};

/// `SQLite`'s default bound-parameter limit.
const MAX_PARAMS_PER_STATEMENT: usize = 999;

/// Quote an identifier, doubling embedded quotes.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| quote_ident(f))
        .collect::<Vec<_>>()
        .join(", ")
}

fn qualified_list(table: &str, fields: &[String]) -> String {
    let table = quote_ident(table);
    fields
        .iter()
        .map(|f| format!("{table}.{}", quote_ident(f)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `"a"."k1" = "b"."k1" AND ...`
fn key_join(left: &str, right: &str, key: &[String]) -> String {
    let (left, right) = (quote_ident(left), quote_ident(right));
    key.iter()
        .map(|k| {
            let k = quote_ident(k);
            format!("{left}.{k} = {right}.{k}")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

// ---------------------------------------------------------------------------
// DDL
// ---------------------------------------------------------------------------

/// `CREATE TABLE IF NOT EXISTS` with untyped columns.
#[must_use]
pub fn create_table(table: &str, fields: &[String]) -> Statement {
    Statement::new(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        column_list(fields)
    ))
}

#[must_use]
pub fn create_scratch(scratch: &ScratchTable) -> Statement {
    Statement::new(format!(
        "CREATE TEMP TABLE {} ({})",
        quote_ident(&scratch.name),
        column_list(&scratch.fields)
    ))
}

#[must_use]
pub fn drop_scratch(scratch_name: &str) -> Statement {
    Statement::new(format!("DROP TABLE IF EXISTS temp.{}", quote_ident(scratch_name)))
}

// ---------------------------------------------------------------------------
// Row movement
// ---------------------------------------------------------------------------

/// Multi-row `INSERT ... VALUES` statements, chunked under the parameter limit.
#[must_use]
pub fn insert_rows(table: &str, fields: &[String], rows: &[Vec<Value>]) -> Vec<Statement> {
    if fields.is_empty() || rows.is_empty() {
        return Vec::new();
    }
    let rows_per_statement = (MAX_PARAMS_PER_STATEMENT / fields.len()).max(1);
    let prefix = format!(
        "INSERT INTO {} ({}) VALUES ",
        quote_ident(table),
        column_list(fields)
    );

    rows.chunks(rows_per_statement)
        .map(|chunk| {
            let mut sql = prefix.clone();
            let mut params = Vec::with_capacity(chunk.len() * fields.len());
            for (i, row) in chunk.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push('(');
                for col in 0..fields.len() {
                    if col > 0 {
                        sql.push_str(", ");
                    }
                    params.push(row.get(col).cloned().unwrap_or(Value::Null));
                    sql.push_str(&format!("?{}", params.len()));
                }
                sql.push(')');
            }
            Statement::with_params(sql, params)
        })
        .collect()
}

#[must_use]
pub fn populate_scratch(scratch: &ScratchTable) -> Vec<Statement> {
    insert_rows(&scratch.name, &scratch.fields, &scratch.rows)
}

/// `DELETE FROM` without a predicate; `SQLite` has no `TRUNCATE`.
#[must_use]
pub fn clear_table(table: &str) -> Statement {
    Statement::new(format!("DELETE FROM {}", quote_ident(table)))
}

/// Select every column of `table` matching all equality `filters`,
/// in insertion order.
#[must_use]
pub fn select_rows(table: &str, filters: &BTreeMap<String, Value>) -> Statement {
    let mut sql = format!("SELECT * FROM {}", quote_ident(table));
    let mut params = Vec::with_capacity(filters.len());
    for (i, (field, value)) in filters.iter().enumerate() {
        sql.push_str(if i == 0 { " WHERE " } else { " AND " });
        if value.is_null() {
            sql.push_str(&format!("{} IS NULL", quote_ident(field)));
        } else {
            params.push(value.clone());
            sql.push_str(&format!("{} = ?{}", quote_ident(field), params.len()));
        }
    }
    sql.push_str(" ORDER BY rowid");
    Statement::with_params(sql, params)
}

/// Select `columns` of `table` in insertion order.
#[must_use]
pub fn select_columns(table: &str, columns: &[String]) -> Statement {
    Statement::new(format!(
        "SELECT {} FROM {} ORDER BY rowid",
        column_list(columns),
        quote_ident(table)
    ))
}

// ---------------------------------------------------------------------------
// Merge steps
// ---------------------------------------------------------------------------

/// Render one merge step of a plan targeting `target` with primary key `key`.
#[must_use]
pub fn merge_step(step: &MergeStep, target: &str, key: &[String], scratch: &ScratchTable) -> Statement {
    let t = quote_ident(target);
    let s = quote_ident(&scratch.name);
    let sql = match step {
        MergeStep::Truncate => format!("DELETE FROM {t}"),
        MergeStep::UpdateExisting { set_fields } => {
            let assignments = set_fields
                .iter()
                .map(|f| {
                    let f = quote_ident(f);
                    format!("{f} = {s}.{f}")
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "UPDATE {t} SET {assignments} FROM {s} WHERE {}",
                key_join(target, &scratch.name, key)
            )
        }
        MergeStep::DeleteScratchRowsInTarget => format!(
            "DELETE FROM {s} WHERE EXISTS (SELECT 1 FROM {t} WHERE {})",
            key_join(target, &scratch.name, key)
        ),
        MergeStep::InsertNew { only_absent } => {
            let mut sql = format!(
                "INSERT INTO {t} ({}) SELECT {} FROM {s}",
                column_list(&scratch.fields),
                qualified_list(&scratch.name, &scratch.fields)
            );
            if *only_absent {
                sql.push_str(&format!(
                    " WHERE NOT EXISTS (SELECT 1 FROM {t} WHERE {})",
                    key_join(target, &scratch.name, key)
                ));
            }
            sql
        }
    };
    Statement::new(sql)
}

// ---------------------------------------------------------------------------
// Quality checks
// ---------------------------------------------------------------------------

#[must_use]
pub fn row_count(table: &str) -> Statement {
    Statement::new(format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
}

/// Number of key values that occur more than once.
#[must_use]
pub fn duplicated_keys(table: &str, key: &[String]) -> Statement {
    Statement::new(format!(
        "SELECT COUNT(*) FROM (SELECT 1 FROM {} GROUP BY {} HAVING COUNT(*) > 1)",
        quote_ident(table),
        column_list(key)
    ))
}

#[must_use]
pub fn null_count(table: &str, field: &str) -> Statement {
    Statement::new(format!(
        "SELECT COUNT(*) FROM {} WHERE {} IS NULL",
        quote_ident(table),
        quote_ident(field)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(rows: usize, width: usize) -> ScratchTable {
        ScratchTable {
            name: "users__stagewise_scratch".into(),
            fields: (0..width).map(|i| format!("f{i}")).collect(),
            rows: (0..rows)
                .map(|r| (0..width).map(|c| Value::Int((r * width + c) as i64)).collect())
                .collect(),
        }
    }

    #[test]
    fn identifiers_are_quoted_and_escaped() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn insert_rows_binds_every_value() {
        let s = scratch(2, 2);
        let stmts = populate_scratch(&s);
        assert_eq!(stmts.len(), 1);
        assert_eq!(
            stmts[0].sql,
            "INSERT INTO \"users__stagewise_scratch\" (\"f0\", \"f1\") VALUES (?1, ?2), (?3, ?4)"
        );
        assert_eq!(stmts[0].params.len(), 4);
    }

    #[test]
    fn insert_rows_chunks_under_parameter_limit() {
        let s = scratch(1000, 3);
        let stmts = populate_scratch(&s);
        assert_eq!(stmts.len(), 4);
        assert!(stmts.iter().all(|st| st.params.len() <= MAX_PARAMS_PER_STATEMENT));
        let total: usize = stmts.iter().map(|st| st.params.len()).sum();
        assert_eq!(total, 3000);
    }

    #[test]
    fn insert_new_only_absent_adds_anti_join() {
        let s = scratch(1, 2);
        let key = vec!["f0".to_string()];
        let stmt = merge_step(&MergeStep::InsertNew { only_absent: true }, "users", &key, &s);
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"users\" (\"f0\", \"f1\") SELECT \"users__stagewise_scratch\".\"f0\", \
             \"users__stagewise_scratch\".\"f1\" FROM \"users__stagewise_scratch\" WHERE NOT EXISTS \
             (SELECT 1 FROM \"users\" WHERE \"users\".\"f0\" = \"users__stagewise_scratch\".\"f0\")"
        );
    }

    #[test]
    fn update_existing_sets_only_requested_fields() {
        let s = scratch(1, 3);
        let key = vec!["f0".to_string()];
        let stmt = merge_step(
            &MergeStep::UpdateExisting {
                set_fields: vec!["f2".into()],
            },
            "users",
            &key,
            &s,
        );
        assert!(stmt.sql.starts_with("UPDATE \"users\" SET \"f2\" = \"users__stagewise_scratch\".\"f2\" FROM"));
        assert!(!stmt.sql.contains("\"f1\""));
    }

    #[test]
    fn select_rows_filters_and_keeps_order() {
        let mut filters = BTreeMap::new();
        filters.insert("page".to_string(), Value::from("NextSong"));
        filters.insert("song".to_string(), Value::Null);
        let stmt = select_rows("staging_events", &filters);
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"staging_events\" WHERE \"page\" = ?1 AND \"song\" IS NULL ORDER BY rowid"
        );
        assert_eq!(stmt.params, vec![Value::from("NextSong")]);
    }

    #[test]
    fn duplicate_count_groups_by_key() {
        let stmt = duplicated_keys("songplays", &["session_id".into(), "start_time".into()]);
        assert!(stmt.sql.contains("GROUP BY \"session_id\", \"start_time\" HAVING COUNT(*) > 1"));
    }
}
