//! Read-only accessor for the operational sensor database
//!
//! The sensor simulator owns this file. We only ever open it through
//! `ReadOnlyHandle`, one scoped handle per call.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

use super::handle::{to_sql_value, HandleError, ReadOnlyHandle};
use crate::config::validation::is_identifier;
use crate::error::{ErrorContext, PipelineError, Result};
use crate::types::SensorRecord;

/// How a caller wants to open the operational source. Only `ReadOnly` is
/// ever granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    const fn keyword(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Structured read against a single table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableQuery {
    pub table: String,
    /// Equality filter on one column
    pub filter: Option<(String, Value)>,
    pub order_by: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TableQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            order_by: None,
            limit: None,
            offset: None,
        }
    }

    #[must_use]
    pub fn filter_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter = Some((column.into(), value.into()));
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.order_by = Some((column.into(), order));
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// A read request against the operational source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationalQuery {
    Table(TableQuery),
    /// A single `SELECT`/`WITH` statement. Anything SQLite does not report
    /// as read-only is refused with `IsolationViolation`.
    Sql { sql: String },
}

impl OperationalQuery {
    pub fn table(table: impl Into<String>) -> TableQuery {
        TableQuery::new(table)
    }

    pub fn sql(sql: impl Into<String>) -> Self {
        OperationalQuery::Sql { sql: sql.into() }
    }
}

impl From<TableQuery> for OperationalQuery {
    fn from(q: TableQuery) -> Self {
        OperationalQuery::Table(q)
    }
}

/// One column as reported by `pragma_table_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    pub row_count: u64,
}

/// Read-only view of the sensor database.
#[derive(Debug, Clone)]
pub struct OperationalSource {
    path: PathBuf,
}

impl OperationalSource {
    /// Register the operational source. Asking for write access is an
    /// isolation violation, whatever the path.
    pub fn open(path: impl AsRef<Path>, mode: AccessMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let ctx = ErrorContext::new("open_operational_source");
        if mode == AccessMode::ReadWrite {
            error!(path = %path.display(), "Refused read-write access to operational source");
            return Err(PipelineError::IsolationViolation {
                message: format!(
                    "operational source {} can only be opened read-only",
                    path.display()
                ),
                context: ctx,
            });
        }
        if !path.is_file() {
            return Err(PipelineError::storage(
                format!("operational source {} does not exist", path.display()),
                ctx,
            ));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a query and return matching rows as sensor records.
    pub fn read(&self, query: &OperationalQuery) -> Result<Vec<SensorRecord>> {
        let ctx = ErrorContext::new("read_operational_data");
        let (sql, params) = match query {
            OperationalQuery::Sql { sql } => (sql.clone(), Vec::new()),
            OperationalQuery::Table(q) => build_table_query(q, &ctx)?,
        };
        let rows = self.with_handle(&ctx, |h| h.select(&sql, &params))?;
        debug!(rows = rows.len(), path = %self.path.display(), "Read operational data");
        Ok(rows)
    }

    /// User tables, sorted by name.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let ctx = ErrorContext::new("list_tables");
        let rows = self.with_handle(&ctx, |h| {
            h.select(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
                &[],
            )
        })?;
        Ok(rows
            .iter()
            .filter_map(|r| r.text("name").ok().map(str::to_string))
            .collect())
    }

    /// Column layout and row count of `table`.
    pub fn table_info(&self, table: &str) -> Result<TableInfo> {
        let ctx = ErrorContext::new("table_info");
        check_identifier(table, &ctx)?;

        let (columns, counted) = self.with_handle(&ctx, |h| {
            let columns = h.select(
                "SELECT name, type, \"notnull\" AS not_null, pk FROM pragma_table_info(?1)",
                &[rusqlite::types::Value::Text(table.to_string())],
            )?;
            if columns.is_empty() {
                return Ok((columns, Vec::new()));
            }
            let counted = h.select(&format!("SELECT COUNT(*) AS row_count FROM \"{table}\""), &[])?;
            Ok((columns, counted))
        })?;

        if columns.is_empty() {
            return Err(PipelineError::invalid_argument(
                format!("table '{table}' does not exist in the operational source"),
                ctx,
            ));
        }

        let flag = |r: &SensorRecord, f: &str| r.number(f).map(|v| v != 0.0).unwrap_or(false);
        Ok(TableInfo {
            table: table.to_string(),
            columns: columns
                .iter()
                .map(|r| ColumnInfo {
                    name: r.text("name").unwrap_or_default().to_string(),
                    data_type: r.text("type").unwrap_or_default().to_string(),
                    not_null: flag(r, "not_null"),
                    primary_key: flag(r, "pk"),
                })
                .collect(),
            row_count: counted
                .first()
                .and_then(|r| r.get("row_count"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
        })
    }

    /// Open, run a trivial query, close. Failures are logged, not returned.
    pub fn verify_connection(&self) -> bool {
        let ctx = ErrorContext::new("verify_connection");
        match self.with_handle(&ctx, |h| h.select("SELECT 1 AS ok", &[])) {
            Ok(rows) => rows.len() == 1,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Operational source unreachable");
                false
            }
        }
    }

    fn with_handle<T>(
        &self,
        ctx: &ErrorContext,
        f: impl FnOnce(&ReadOnlyHandle) -> std::result::Result<T, HandleError>,
    ) -> Result<T> {
        let handle = ReadOnlyHandle::open(&self.path).map_err(|e| into_pipeline_error(e, ctx))?;
        let value = f(&handle).map_err(|e| into_pipeline_error(e, ctx))?;
        handle.close().map_err(|e| into_pipeline_error(e, ctx))?;
        Ok(value)
    }
}

fn into_pipeline_error(err: HandleError, ctx: &ErrorContext) -> PipelineError {
    match err {
        HandleError::WriteRefused(message) => {
            error!(operation = ctx.operation, %message, "Refused write to operational source");
            PipelineError::IsolationViolation {
                message,
                context: ctx.clone(),
            }
        }
        HandleError::Sqlite(e) => PipelineError::storage(e, ctx.clone()),
    }
}

fn check_identifier(name: &str, ctx: &ErrorContext) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(PipelineError::invalid_argument(
            format!("'{name}' is not a valid identifier"),
            ctx.clone(),
        ))
    }
}

fn build_table_query(
    q: &TableQuery,
    ctx: &ErrorContext,
) -> Result<(String, Vec<rusqlite::types::Value>)> {
    check_identifier(&q.table, ctx)?;
    let mut sql = format!("SELECT * FROM \"{}\"", q.table);
    let mut params = Vec::new();

    if let Some((column, value)) = &q.filter {
        check_identifier(column, ctx)?;
        let param = to_sql_value(value).ok_or_else(|| {
            PipelineError::invalid_argument(
                format!("filter value for '{column}' must be a scalar"),
                ctx.clone(),
            )
        })?;
        params.push(param);
        sql.push_str(&format!(" WHERE \"{column}\" = ?{}", params.len()));
    }
    if let Some((column, order)) = &q.order_by {
        check_identifier(column, ctx)?;
        sql.push_str(&format!(" ORDER BY \"{column}\" {}", order.keyword()));
    }
    if q.limit.is_some() || q.offset.is_some() {
        // SQLite needs a LIMIT before OFFSET; -1 means unbounded
        let limit = q.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        params.push(rusqlite::types::Value::Integer(limit));
        sql.push_str(&format!(" LIMIT ?{}", params.len()));
        if let Some(offset) = q.offset {
            params.push(rusqlite::types::Value::Integer(
                i64::try_from(offset).unwrap_or(i64::MAX),
            ));
            sql.push_str(&format!(" OFFSET ?{}", params.len()));
        }
    }
    Ok((sql, params))
}
