//! Capability-typed SQLite handles
//!
//! `ReadWriteHandle` is only ever opened on the config store.
//! `ReadOnlyHandle` is the only handle type the operational source hands
//! out: it is opened with `SQLITE_OPEN_READ_ONLY`, has no write methods, and
//! refuses any statement SQLite does not report as read-only.

use regex::Regex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde_json::{Map, Number, Value};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::types::SensorRecord;

/// Failure inside a handle, before it is given request context.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("refused write through read-only handle: {0}")]
    WriteRefused(String),
}

// ============================================================================
// Read-write handle (config store only)
// ============================================================================

/// Exclusive connection to the config store. Dropping it closes the
/// connection; `close` does the same but reports close errors.
#[derive(Debug)]
pub struct ReadWriteHandle {
    conn: Connection,
    path: PathBuf,
}

impl ReadWriteHandle {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        // Contention is handled by RetryPolicy
        conn.busy_timeout(Duration::ZERO)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn close(self) -> rusqlite::Result<()> {
        self.conn.close().map_err(|(_, err)| err)
    }
}

// ============================================================================
// Read-only handle (operational source)
// ============================================================================

#[allow(clippy::expect_used)]
fn select_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?is)^\s*(select|with)\b").expect("select pattern compiles"))
}

#[derive(Debug)]
pub struct ReadOnlyHandle {
    conn: Connection,
    path: PathBuf,
}

impl ReadOnlyHandle {
    /// Open an existing database read-only. Never creates the file.
    pub fn open(path: &Path) -> Result<Self, HandleError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.pragma_update(None, "query_only", true)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a single `SELECT`/`WITH` statement and return each row as a
    /// column-name map.
    pub fn select(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SensorRecord>, HandleError> {
        let statement = sql.trim().trim_end_matches(';');
        if !select_pattern().is_match(statement) {
            return Err(HandleError::WriteRefused(format!(
                "only SELECT/WITH statements are allowed: {}",
                preview(statement)
            )));
        }
        if statement.contains(';') {
            return Err(HandleError::WriteRefused(
                "multiple statements are not allowed".to_string(),
            ));
        }

        let mut stmt = self.conn.prepare(statement)?;
        // Catches writes hidden behind a leading WITH or SELECT
        if !stmt.readonly() {
            return Err(HandleError::WriteRefused(format!(
                "statement modifies the database: {}",
                preview(statement)
            )));
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut map = Map::with_capacity(columns.len());
            for (idx, name) in columns.iter().enumerate() {
                map.insert(name.clone(), to_json(row.get_ref(idx)?));
            }
            out.push(SensorRecord::from_map(map));
        }
        Ok(out)
    }

    pub fn close(self) -> Result<(), HandleError> {
        self.conn.close().map_err(|(_, err)| HandleError::Sqlite(err))
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect())
        }
    }
}

/// Convert a JSON filter value into an SQLite parameter.
pub(crate) fn to_sql_value(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => Some(SqlValue::Null),
        Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real)),
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn preview(sql: &str) -> String {
    let mut s: String = sql.chars().take(60).collect();
    if sql.chars().count() > 60 {
        s.push_str("...");
    }
    s
}
