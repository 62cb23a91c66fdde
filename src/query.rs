//! Query builder: paginated, optionally sorted reads over a single table.
//!
//! The same request shape runs against either the ephemeral DuckDB store or
//! the durable store; only the SQL dialect differs. Results are materialized
//! twice, as ordered tuples and as objects keyed by column name.

use crate::durable::DurableStore;
use crate::ephemeral::EnginePool;
use crate::error::Result;
use itertools::Itertools;
use serde_json::{Map, Value};
use std::time::Instant;

/// Name of the synthetic row number column.
pub const ROW_NUMBER_COLUMN: &str = "rowid";

/// SQL flavour of the engine executing a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    DuckDb,
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Select-list item producing the 1-based row number.
    fn row_number_item(self) -> &'static str {
        match self {
            Dialect::DuckDb | Dialect::Postgres => "row_number() OVER () AS rowid",
            // native row identifier
            Dialect::Sqlite => ROW_NUMBER_COLUMN,
        }
    }
}

/// Paging and ordering options for a table read.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    /// Page size; `<= 0` means unbounded
    pub limit: i64,

    /// Rows to skip; `<= 0` means none
    pub offset: i64,

    /// Single sort column, passed to the engine unvalidated
    pub sort_column: Option<String>,

    pub sort_descending: bool,

    pub include_row_number: bool,
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            limit: 0,
            offset: 0,
            sort_column: None,
            sort_descending: false,
            include_row_number: true,
        }
    }
}

/// Quote an SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Build the `SELECT` for `table` according to `spec`.
pub fn build_select(dialect: Dialect, table: &str, spec: &QuerySpec) -> String {
    let mut sql = String::from("SELECT ");
    if spec.include_row_number {
        sql.push_str(dialect.row_number_item());
        sql.push_str(", ");
    }
    sql.push_str("* FROM ");
    sql.push_str(&quote_ident(table));

    if let Some(column) = spec.sort_column.as_deref().filter(|c| !c.is_empty()) {
        sql.push_str(" ORDER BY ");
        sql.push_str(&quote_ident(column));
        if spec.sort_descending {
            sql.push_str(" DESC");
        }
    }

    if spec.limit > 0 {
        sql.push_str(&format!(" LIMIT {}", spec.limit));
    } else if spec.offset > 0 && dialect == Dialect::Sqlite {
        // SQLite only accepts OFFSET after a LIMIT clause
        sql.push_str(" LIMIT -1");
    }

    if spec.offset > 0 {
        sql.push_str(&format!(" OFFSET {}", spec.offset));
    }

    sql
}

/// Build the column list and placeholder list of an insert statement.
pub fn insert_statement(dialect: Dialect, table: &str, columns: &[String]) -> String {
    let column_list = columns.iter().map(|c| quote_ident(c)).join(", ");
    let placeholders = match dialect {
        Dialect::Postgres => (1..=columns.len()).map(|i| format!("${}", i)).join(", "),
        Dialect::DuckDb | Dialect::Sqlite => std::iter::repeat("?").take(columns.len()).join(", "),
    };
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        column_list,
        placeholders
    )
}

/// `CREATE TABLE` with one text column per name.
pub fn create_text_table(table: &str, columns: &[String]) -> String {
    let column_defs = columns
        .iter()
        .map(|c| format!("{} TEXT", quote_ident(c)))
        .join(", ");
    format!("CREATE TABLE {} ({})", quote_ident(table), column_defs)
}

/// A materialized page of results.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub tuple_rows: Vec<Vec<Value>>,
    pub named_rows: Vec<Map<String, Value>>,

    /// Rows in this page, not rows in the table.
    pub row_count: usize,

    /// Wall-clock time spent executing and reading the statement
    pub elapsed_ms: f64,
}

impl QueryOutput {
    /// Assemble both row shapes from tuple rows read since `started`.
    pub fn assemble(columns: Vec<String>, tuple_rows: Vec<Vec<Value>>, started: Instant) -> Self {
        let named_rows = tuple_rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<Map<String, Value>>()
            })
            .collect();
        let elapsed_ms = started.elapsed().as_micros() as f64 / 1000.0;

        Self {
            row_count: tuple_rows.len(),
            columns,
            tuple_rows,
            named_rows,
            elapsed_ms,
        }
    }
}

/// Where a query runs.
pub enum QuerySource<'a> {
    /// The per-id DuckDB store, by id and its fixed table
    Ephemeral {
        pool: &'a EnginePool,
        id: &'a str,
        table: &'a str,
    },
    /// The durable store, by table name
    Durable {
        store: &'a dyn DurableStore,
        table: &'a str,
    },
}

/// Run `spec` against `source`.
pub async fn execute(source: QuerySource<'_>, spec: &QuerySpec) -> Result<QueryOutput> {
    match source {
        QuerySource::Ephemeral { pool, id, table } => pool.query(id, table, spec).await,
        QuerySource::Durable { store, table } => store.query_table(table, spec).await,
    }
}

/// Decode raw bytes to a JSON string.
pub(crate) fn text_value(bytes: &[u8]) -> Value {
    Value::String(String::from_utf8_lossy(bytes).into_owned())
}

/// JSON number for finite floats, null otherwise.
pub(crate) fn float_value(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_select_includes_row_number() {
        let sql = build_select(Dialect::DuckDb, "csv_data", &QuerySpec::default());
        assert_eq!(sql, "SELECT row_number() OVER () AS rowid, * FROM \"csv_data\"");
    }

    #[test]
    fn test_sqlite_uses_native_rowid() {
        let spec = QuerySpec {
            include_row_number: true,
            ..QuerySpec::default()
        };
        let sql = build_select(Dialect::Sqlite, "csv_1", &spec);
        assert_eq!(sql, "SELECT rowid, * FROM \"csv_1\"");
    }

    #[test]
    fn test_sort_limit_offset() {
        let spec = QuerySpec {
            limit: 10,
            offset: 20,
            sort_column: Some("a".to_string()),
            sort_descending: true,
            include_row_number: false,
        };
        let sql = build_select(Dialect::Postgres, "t", &spec);
        assert_eq!(sql, "SELECT * FROM \"t\" ORDER BY \"a\" DESC LIMIT 10 OFFSET 20");
    }

    #[test]
    fn test_non_positive_limit_and_offset_are_ignored() {
        let spec = QuerySpec {
            limit: -5,
            offset: 0,
            sort_column: Some(String::new()),
            include_row_number: false,
            ..QuerySpec::default()
        };
        assert_eq!(build_select(Dialect::DuckDb, "t", &spec), "SELECT * FROM \"t\"");
    }

    #[test]
    fn test_offset_without_limit() {
        let spec = QuerySpec {
            offset: 3,
            include_row_number: false,
            ..QuerySpec::default()
        };
        assert_eq!(build_select(Dialect::DuckDb, "t", &spec), "SELECT * FROM \"t\" OFFSET 3");
        assert_eq!(
            build_select(Dialect::Sqlite, "t", &spec),
            "SELECT * FROM \"t\" LIMIT -1 OFFSET 3"
        );
    }

    #[test]
    fn test_sort_column_is_quoted() {
        let spec = QuerySpec {
            sort_column: Some("we\"ird".to_string()),
            include_row_number: false,
            ..QuerySpec::default()
        };
        assert_eq!(
            build_select(Dialect::DuckDb, "t", &spec),
            "SELECT * FROM \"t\" ORDER BY \"we\"\"ird\""
        );
    }

    #[test]
    fn test_insert_placeholders_per_dialect() {
        let columns = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            insert_statement(Dialect::Postgres, "t", &columns),
            "INSERT INTO \"t\" (\"a\", \"b\") VALUES ($1, $2)"
        );
        assert_eq!(
            insert_statement(Dialect::Sqlite, "t", &columns),
            "INSERT INTO \"t\" (\"a\", \"b\") VALUES (?, ?)"
        );
    }

    #[test]
    fn test_create_text_table() {
        let columns = vec!["a".to_string(), "b c".to_string()];
        assert_eq!(
            create_text_table("csv_x", &columns),
            "CREATE TABLE \"csv_x\" (\"a\" TEXT, \"b c\" TEXT)"
        );
    }

    #[test]
    fn test_assemble_builds_both_shapes() {
        let columns = vec!["a".to_string(), "b".to_string()];
        let rows = vec![
            vec![Value::from(1), Value::from("x")],
            vec![Value::from(2), Value::Null],
        ];
        let output = QueryOutput::assemble(columns, rows, Instant::now());
        assert_eq!(output.row_count, 2);
        assert_eq!(output.named_rows[1]["a"], Value::from(2));
        assert_eq!(output.named_rows[1]["b"], Value::Null);
        assert!(output.elapsed_ms >= 0.0);
    }

    #[test]
    fn test_value_helpers() {
        assert_eq!(text_value(b"abc"), Value::from("abc"));
        assert_eq!(float_value(f64::NAN), Value::Null);
        assert_eq!(float_value(1.5), Value::from(1.5));
    }
}
