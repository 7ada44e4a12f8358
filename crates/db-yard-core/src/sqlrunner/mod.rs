//! Ad-hoc SQL runner boundary.
//!
//! The supervisor treats query execution against child databases as an
//! external collaborator behind a small trait: the admin endpoint and the
//! sidecar's context snapshot queries are the only consumers. The default
//! implementation opens the database read-only.

use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;

/// Result of one query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    /// Whether the query ran.
    pub ok: bool,

    /// Row objects, column name to JSON value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<serde_json::Map<String, serde_json::Value>>>,

    /// Error description when `ok` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryOutcome {
    /// A failed outcome.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            rows: None,
            error: Some(error.into()),
        }
    }

    /// The rows as one JSON value.
    #[must_use]
    pub fn rows_json(&self) -> serde_json::Value {
        self.rows
            .as_ref()
            .map(|rows| serde_json::Value::Array(rows.iter().cloned().map(Into::into).collect()))
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Executes queries against a database file.
pub trait SqlRunner: Send + Sync {
    /// Run one query and collect its rows.
    fn run_query(&self, db_path: &Path, sql: &str) -> QueryOutcome;
}

/// Read-only in-process runner.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadOnlySqlRunner;

impl SqlRunner for ReadOnlySqlRunner {
    fn run_query(&self, db_path: &Path, sql: &str) -> QueryOutcome {
        let conn = match Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        ) {
            Ok(conn) => conn,
            Err(err) => return QueryOutcome::failed(format!("open failed: {err}")),
        };

        let mut stmt = match conn.prepare(sql) {
            Ok(stmt) => stmt,
            Err(err) => return QueryOutcome::failed(format!("prepare failed: {err}")),
        };

        let columns: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();

        let mut rows_out = Vec::new();
        let mut rows = match stmt.query([]) {
            Ok(rows) => rows,
            Err(err) => return QueryOutcome::failed(format!("query failed: {err}")),
        };

        loop {
            match rows.next() {
                Ok(Some(row)) => {
                    let mut object = serde_json::Map::new();
                    for (index, name) in columns.iter().enumerate() {
                        object.insert(name.clone(), value_to_json(row.get_ref(index)));
                    }
                    rows_out.push(object);
                }
                Ok(None) => break,
                Err(err) => return QueryOutcome::failed(format!("row read failed: {err}")),
            }
        }

        QueryOutcome {
            ok: true,
            rows: Some(rows_out),
            error: None,
        }
    }
}

fn value_to_json(value: Result<ValueRef<'_>, rusqlite::Error>) -> serde_json::Value {
    match value {
        Ok(ValueRef::Null) => serde_json::Value::Null,
        Ok(ValueRef::Integer(i)) => serde_json::Value::from(i),
        Ok(ValueRef::Real(f)) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Ok(ValueRef::Text(t)) => {
            serde_json::Value::String(String::from_utf8_lossy(t).to_string())
        }
        Ok(ValueRef::Blob(b)) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
        Err(err) => serde_json::Value::String(format!("<error: {err}>")),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn make_db(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("q.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE t (name TEXT, n INTEGER);
             INSERT INTO t VALUES ('alpha', 1), ('beta', 2);",
        )
        .unwrap();
        path
    }

    #[test]
    fn test_select_rows() {
        let dir = TempDir::new().unwrap();
        let db = make_db(dir.path());

        let outcome = ReadOnlySqlRunner.run_query(&db, "SELECT name, n FROM t ORDER BY n");
        assert!(outcome.ok);
        let rows = outcome.rows.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "alpha");
        assert_eq!(rows[1]["n"], 2);
    }

    #[test]
    fn test_write_rejected_by_read_only_open() {
        let dir = TempDir::new().unwrap();
        let db = make_db(dir.path());

        let outcome = ReadOnlySqlRunner.run_query(&db, "INSERT INTO t VALUES ('x', 3)");
        assert!(!outcome.ok);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_malformed_sql_fails_gracefully() {
        let dir = TempDir::new().unwrap();
        let db = make_db(dir.path());

        let outcome = ReadOnlySqlRunner.run_query(&db, "SELEC nope");
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("prepare failed"));
    }

    #[test]
    fn test_missing_database_fails_gracefully() {
        let outcome =
            ReadOnlySqlRunner.run_query(Path::new("/nonexistent/x.db"), "SELECT 1");
        assert!(!outcome.ok);
    }
}
