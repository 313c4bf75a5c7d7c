//! ConfigStore - durable phase state and execution audit log
//!
//! One SQLite file, WAL mode, three tables:
//! - `phase_history`: append-only snapshots, `seq` orders them
//! - `phase_current`: single row pointing at the current snapshot
//! - `execution_records`: one row per processed batch
//!
//! Every public operation opens its own `ReadWriteHandle`, runs, and closes it
//! again, so short-lived callers never leak connections. Writes use
//! `BEGIN IMMEDIATE` so the history append and the pointer update commit
//! together or not at all.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::handle::ReadWriteHandle;
use super::retry::{AttemptError, RetryPolicy};
use crate::config::defaults;
use crate::error::{ErrorContext, PipelineError, Result};
use crate::types::{ExecutionOutcome, ExecutionRecord, Phase, PhaseConfig};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS store_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS phase_history (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    phase      TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    updated_by TEXT NOT NULL,
    reason     TEXT
);
CREATE TABLE IF NOT EXISTS phase_current (
    id  INTEGER PRIMARY KEY CHECK (id = 1),
    seq INTEGER NOT NULL REFERENCES phase_history(seq)
);
CREATE TABLE IF NOT EXISTS execution_records (
    id                     INTEGER PRIMARY KEY AUTOINCREMENT,
    phase                  TEXT NOT NULL,
    records_in             INTEGER NOT NULL,
    records_routed_valid   INTEGER NOT NULL,
    records_routed_invalid INTEGER NOT NULL,
    destinations           TEXT NOT NULL,
    recorded_at            TEXT NOT NULL,
    outcome                TEXT NOT NULL,
    error_detail           TEXT,
    node_id                TEXT NOT NULL
);
";

const PHASE_COLUMNS: &str = "h.seq, h.phase, h.updated_at, h.updated_by, h.reason";

/// Durable store for the current phase, its history, and execution records.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    retry: RetryPolicy,
}

impl ConfigStore {
    /// Open (creating if needed) the store at `path` and make sure the schema
    /// exists. Switches the file to WAL so readers never block on a writer.
    pub fn open(path: impl AsRef<Path>, retry: RetryPolicy) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            retry,
        };
        let ctx = ErrorContext::new("open_config_store");

        store.with_handle(&ctx, |conn| {
            let mode: String = conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .map_err(|e| AttemptError::classify(e, &ctx))?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| AttemptError::classify(e, &ctx))?;
            tx.execute_batch(SCHEMA)
                .map_err(|e| AttemptError::classify(e, &ctx))?;
            let version: Option<String> = tx
                .query_row(
                    "SELECT value FROM store_meta WHERE key = 'schema_version'",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| AttemptError::classify(e, &ctx))?;
            match version {
                None => {
                    tx.execute(
                        "INSERT INTO store_meta (key, value) VALUES ('schema_version', ?1)",
                        params![defaults::STORE_SCHEMA_VERSION.to_string()],
                    )
                    .map_err(|e| AttemptError::classify(e, &ctx))?;
                }
                Some(v) if v == defaults::STORE_SCHEMA_VERSION.to_string() => {}
                Some(v) => {
                    return Err(PipelineError::storage(
                        format!(
                            "unsupported config store schema version {v} (expected {})",
                            defaults::STORE_SCHEMA_VERSION
                        ),
                        ctx.clone(),
                    )
                    .into());
                }
            }
            tx.commit().map_err(|e| AttemptError::classify(e, &ctx))?;
            debug!(journal_mode = %mode, "Config store schema ready");
            Ok(())
        })?;

        info!(path = %store.path.display(), "Config store opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    // ========================================================================
    // Phase state
    // ========================================================================

    /// Most recently committed phase. `NotInitialized` on a fresh store.
    pub fn get_current_phase(&self) -> Result<PhaseConfig> {
        let ctx = ErrorContext::new("get_current_phase");
        let current = self.with_handle(&ctx, |conn| {
            read_current(conn).map_err(|e| AttemptError::classify(e, &ctx))
        })?;
        match current {
            Some(row) => row.into_phase_config(&ctx),
            None => Err(PipelineError::NotInitialized { context: ctx }),
        }
    }

    /// Append a new snapshot and move the current pointer to it, atomically.
    ///
    /// Only canonical phase identifiers are accepted.
    pub fn set_phase(&self, phase: &str, actor: &str, reason: Option<&str>) -> Result<PhaseConfig> {
        let ctx = ErrorContext::new("set_phase")
            .with_phase(phase)
            .with_actor(actor);
        let parsed: Phase = phase.parse().map_err(|e: crate::types::PhaseParseError| {
            PipelineError::InvalidPhase {
                name: e.name,
                hint: e.hint,
                context: ctx.clone(),
            }
        })?;
        if actor.trim().is_empty() {
            return Err(PipelineError::invalid_argument("actor must not be empty", ctx));
        }

        // Stored with microsecond precision; return exactly what a later read sees
        let updated_at = Utc::now().trunc_subsecs(6);
        let seq = self.with_handle(&ctx, |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| AttemptError::classify(e, &ctx))?;
            let seq = append_phase(&tx, parsed, updated_at, actor, reason)
                .map_err(|e| AttemptError::classify(e, &ctx))?;
            tx.commit().map_err(|e| AttemptError::classify(e, &ctx))?;
            Ok(seq)
        })?;

        info!(phase = %parsed, actor = %actor, seq, "Pipeline phase set");
        Ok(PhaseConfig {
            seq,
            phase: parsed,
            updated_at,
            updated_by: actor.to_string(),
            reason: reason.map(str::to_string),
        })
    }

    /// Apply `phase` only if no phase has ever been set, returning whatever is
    /// current afterwards. Check and insert share one immediate transaction,
    /// so concurrent first readers write the default exactly once.
    pub fn initialize_default(&self, phase: Phase, actor: &str, reason: &str) -> Result<PhaseConfig> {
        let ctx = ErrorContext::new("initialize_default")
            .with_phase(phase.as_str())
            .with_actor(actor);
        let now = Utc::now();

        let (row, created) = self.with_handle(&ctx, |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| AttemptError::classify(e, &ctx))?;
            if let Some(existing) = read_current(&tx).map_err(|e| AttemptError::classify(e, &ctx))? {
                return Ok((existing, false));
            }
            let seq = append_phase(&tx, phase, now, actor, Some(reason))
                .map_err(|e| AttemptError::classify(e, &ctx))?;
            tx.commit().map_err(|e| AttemptError::classify(e, &ctx))?;
            Ok((
                PhaseRow {
                    seq,
                    phase: phase.as_str().to_string(),
                    updated_at: format_ts(now),
                    updated_by: actor.to_string(),
                    reason: Some(reason.to_string()),
                },
                true,
            ))
        })?;

        if created {
            info!(phase = %phase, actor = %actor, "Applied initial pipeline phase");
        }
        row.into_phase_config(&ctx)
    }

    /// Up to `limit` snapshots, most recent first.
    pub fn get_history(&self, limit: usize) -> Result<Vec<PhaseConfig>> {
        let ctx = ErrorContext::new("get_history");
        if limit == 0 {
            return Err(PipelineError::invalid_argument("limit must be > 0", ctx));
        }
        let rows = self.with_handle(&ctx, |conn| {
            query_phase_rows(conn, limit).map_err(|e| AttemptError::classify(e, &ctx))
        })?;
        rows.into_iter().map(|r| r.into_phase_config(&ctx)).collect()
    }

    /// Number of snapshots currently retained.
    pub fn history_len(&self) -> Result<usize> {
        let ctx = ErrorContext::new("history_len");
        self.with_handle(&ctx, |conn| {
            count_rows(conn, "phase_history").map_err(|e| AttemptError::classify(e, &ctx))
        })
    }

    // ========================================================================
    // Execution records
    // ========================================================================

    /// Append one execution record and return its id.
    pub fn record_execution(&self, record: &ExecutionRecord) -> Result<i64> {
        let ctx = ErrorContext::new("record_execution").with_phase(record.phase_at_time.as_str());
        let destinations = serde_json::to_string(&record.destinations)
            .map_err(|e| PipelineError::storage(e, ctx.clone()))?;
        let counts = [
            record.records_in,
            record.records_routed_valid,
            record.records_routed_invalid,
        ]
        .map(|n| i64::try_from(n).unwrap_or(i64::MAX));

        let id = self.with_handle(&ctx, |conn| {
            conn.execute(
                "INSERT INTO execution_records
                    (phase, records_in, records_routed_valid, records_routed_invalid,
                     destinations, recorded_at, outcome, error_detail, node_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.phase_at_time.as_str(),
                    counts[0],
                    counts[1],
                    counts[2],
                    destinations,
                    format_ts(record.timestamp),
                    record.outcome.as_str(),
                    record.error_detail,
                    record.node_id,
                ],
            )
            .map_err(|e| AttemptError::classify(e, &ctx))?;
            Ok(conn.last_insert_rowid())
        })?;

        debug!(id, phase = %record.phase_at_time, outcome = %record.outcome, "Execution recorded");
        Ok(id)
    }

    /// Up to `limit` execution records, most recent first.
    pub fn execution_history(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let ctx = ErrorContext::new("execution_history");
        if limit == 0 {
            return Err(PipelineError::invalid_argument("limit must be > 0", ctx));
        }
        let rows = self.with_handle(&ctx, |conn| {
            query_execution_rows(conn, limit).map_err(|e| AttemptError::classify(e, &ctx))
        })?;
        rows.into_iter().map(|r| r.into_record(&ctx)).collect()
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// Keep the `keep` most recent snapshots. The current snapshot is never
    /// removed. Returns the number of rows deleted.
    pub fn prune_history(&self, keep: usize) -> Result<usize> {
        let ctx = ErrorContext::new("prune_history");
        if keep == 0 {
            return Err(PipelineError::invalid_argument("keep must be > 0", ctx));
        }
        let deleted = self.with_handle(&ctx, |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| AttemptError::classify(e, &ctx))?;
            let n = tx
                .execute(
                    "DELETE FROM phase_history
                     WHERE seq NOT IN (SELECT seq FROM phase_history ORDER BY seq DESC LIMIT ?1)
                       AND seq != COALESCE((SELECT seq FROM phase_current WHERE id = 1), -1)",
                    params![limit_param(keep)],
                )
                .map_err(|e| AttemptError::classify(e, &ctx))?;
            tx.commit().map_err(|e| AttemptError::classify(e, &ctx))?;
            Ok(n)
        })?;
        if deleted > 0 {
            info!(deleted, keep, "Pruned phase history");
        }
        Ok(deleted)
    }

    /// Keep the `keep` most recent execution records.
    pub fn prune_executions(&self, keep: usize) -> Result<usize> {
        let ctx = ErrorContext::new("prune_executions");
        if keep == 0 {
            return Err(PipelineError::invalid_argument("keep must be > 0", ctx));
        }
        let deleted = self.with_handle(&ctx, |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| AttemptError::classify(e, &ctx))?;
            let n = tx
                .execute(
                    "DELETE FROM execution_records
                     WHERE id NOT IN (SELECT id FROM execution_records ORDER BY id DESC LIMIT ?1)",
                    params![limit_param(keep)],
                )
                .map_err(|e| AttemptError::classify(e, &ctx))?;
            tx.commit().map_err(|e| AttemptError::classify(e, &ctx))?;
            Ok(n)
        })?;
        if deleted > 0 {
            info!(deleted, keep, "Pruned execution records");
        }
        Ok(deleted)
    }

    // ========================================================================
    // Scoped handle
    // ========================================================================

    /// Open a handle, run `f`, close the handle, retrying the whole unit on
    /// contention. The handle is released on every path: explicitly on
    /// success, by `Drop` on error.
    fn with_handle<T>(
        &self,
        ctx: &ErrorContext,
        mut f: impl FnMut(&mut Connection) -> std::result::Result<T, AttemptError>,
    ) -> Result<T> {
        self.retry.run(ctx, || {
            let mut handle =
                ReadWriteHandle::open(&self.path).map_err(|e| AttemptError::classify(e, ctx))?;
            let value = f(handle.conn_mut())?;
            Ok(settle(value, handle.close(), ctx))
        })
    }
}

/// The unit of work has already committed when the handle closes, so a close
/// error is logged and never retried.
fn settle<T>(value: T, closed: rusqlite::Result<()>, ctx: &ErrorContext) -> T {
    if let Err(e) = closed {
        warn!(operation = ctx.operation, error = %e, "Config store handle did not close cleanly");
    }
    value
}

// ============================================================================
// Row helpers
// ============================================================================

struct PhaseRow {
    seq: i64,
    phase: String,
    updated_at: String,
    updated_by: String,
    reason: Option<String>,
}

impl PhaseRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            phase: row.get(1)?,
            updated_at: row.get(2)?,
            updated_by: row.get(3)?,
            reason: row.get(4)?,
        })
    }

    /// Stored rows are re-validated on the way out; a phase name that no
    /// longer parses is corruption, not a caller error.
    fn into_phase_config(self, ctx: &ErrorContext) -> Result<PhaseConfig> {
        let phase = self.phase.parse::<Phase>().map_err(|e| {
            PipelineError::storage(format!("corrupt history row {}: {e}", self.seq), ctx.clone())
        })?;
        Ok(PhaseConfig {
            seq: self.seq,
            phase,
            updated_at: parse_ts(&self.updated_at, ctx)?,
            updated_by: self.updated_by,
            reason: self.reason,
        })
    }
}

struct ExecutionRow {
    id: i64,
    phase: String,
    counts: [i64; 3],
    destinations: String,
    recorded_at: String,
    outcome: String,
    error_detail: Option<String>,
    node_id: String,
}

impl ExecutionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            phase: row.get(1)?,
            counts: [row.get(2)?, row.get(3)?, row.get(4)?],
            destinations: row.get(5)?,
            recorded_at: row.get(6)?,
            outcome: row.get(7)?,
            error_detail: row.get(8)?,
            node_id: row.get(9)?,
        })
    }

    fn into_record(self, ctx: &ErrorContext) -> Result<ExecutionRecord> {
        let corrupt = |what: String| {
            PipelineError::storage(format!("corrupt execution record {}: {what}", self.id), ctx.clone())
        };
        let phase = self.phase.parse::<Phase>().map_err(|e| corrupt(e.to_string()))?;
        let outcome = self.outcome.parse::<ExecutionOutcome>().map_err(&corrupt)?;
        let destinations: Vec<String> =
            serde_json::from_str(&self.destinations).map_err(|e| corrupt(e.to_string()))?;
        let [records_in, valid, invalid] = self.counts.map(|n| usize::try_from(n).unwrap_or(0));
        Ok(ExecutionRecord {
            id: Some(self.id),
            phase_at_time: phase,
            records_in,
            records_routed_valid: valid,
            records_routed_invalid: invalid,
            destinations,
            timestamp: parse_ts(&self.recorded_at, ctx)?,
            outcome,
            error_detail: self.error_detail,
            node_id: self.node_id,
        })
    }
}

fn read_current(conn: &Connection) -> rusqlite::Result<Option<PhaseRow>> {
    conn.query_row(
        &format!(
            "SELECT {PHASE_COLUMNS} FROM phase_current c
             JOIN phase_history h ON h.seq = c.seq
             WHERE c.id = 1"
        ),
        [],
        PhaseRow::from_row,
    )
    .optional()
}

fn query_phase_rows(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<PhaseRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PHASE_COLUMNS} FROM phase_history h ORDER BY h.seq DESC LIMIT ?1"
    ))?;
    let rows = stmt.query_map(params![limit_param(limit)], PhaseRow::from_row)?;
    rows.collect()
}

fn query_execution_rows(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<ExecutionRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, phase, records_in, records_routed_valid, records_routed_invalid,
                destinations, recorded_at, outcome, error_detail, node_id
         FROM execution_records ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit_param(limit)], ExecutionRow::from_row)?;
    rows.collect()
}

fn append_phase(
    conn: &Connection,
    phase: Phase,
    at: DateTime<Utc>,
    actor: &str,
    reason: Option<&str>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO phase_history (phase, updated_at, updated_by, reason) VALUES (?1, ?2, ?3, ?4)",
        params![phase.as_str(), format_ts(at), actor, reason],
    )?;
    let seq = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO phase_current (id, seq) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET seq = excluded.seq",
        params![seq],
    )?;
    Ok(seq)
}

fn count_rows(conn: &Connection, table: &str) -> rusqlite::Result<usize> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    Ok(usize::try_from(n).unwrap_or(0))
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str, ctx: &ErrorContext) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::storage(format!("bad timestamp '{raw}': {e}"), ctx.clone()))
}
