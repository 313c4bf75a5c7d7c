//! PipelineController - orchestration and isolation boundary
//!
//! The only component that mutates the config store. Holds one `ConfigStore`
//! and one `PhaseRouter`; the operational sensor database is reached through
//! a fresh read-only `OperationalSource` per call.
//!
//! ```text
//! get_phase ──► ConfigStore ──(NotInitialized)──► initialize_default(initial_phase)
//! switch_phase ──► alias resolution ──► ConfigStore::set_phase ──► retention
//! process_batch ──► get_phase ──► PhaseRouter::route ──► record_execution
//! read_operational_data ──► OperationalSource (read-only) ──► SensorRecord rows
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::{defaults, PipelineConfig, RetentionConfig};
use crate::error::{ErrorContext, PipelineError, Result};
use crate::routing::{PhaseRouter, RoutingResult};
use crate::storage::{
    same_storage, AccessMode, ConfigStore, OperationalQuery, OperationalSource, RetryPolicy,
    TableInfo,
};
use crate::types::{ExecutionOutcome, ExecutionRecord, Phase, PhaseConfig, SensorRecord};

/// Rows removed by a `prune` call. `None` where that log was not pruned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub history_removed: Option<usize>,
    pub executions_removed: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct PipelineController {
    store: ConfigStore,
    router: PhaseRouter,
    sensor_db: Option<PathBuf>,
    sensor_table: String,
    initial_phase: Phase,
    node_id: String,
    retention: RetentionConfig,
}

impl PipelineController {
    /// Build a controller from configuration.
    ///
    /// Fails with `Configuration` when the config store and the sensor
    /// database resolve to the same file. The sensor database itself is not
    /// opened here; it may not exist yet when the producer starts later.
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        Self::with_router(config, PhaseRouter::from_config(config))
    }

    pub fn with_router(config: &PipelineConfig, router: PhaseRouter) -> Result<Self> {
        config.validate()?;
        let storage = &config.storage;

        if let Some(ref sensor_db) = storage.sensor_db {
            check_isolation(&storage.config_db, sensor_db)?;
        }

        let store = ConfigStore::open(&storage.config_db, RetryPolicy::from(&config.retry))?;
        info!(
            config_db = %storage.config_db.display(),
            sensor_db = ?storage.sensor_db.as_ref().map(|p| p.display().to_string()),
            node = %config.pipeline.node_id,
            "Pipeline controller ready"
        );

        Ok(Self {
            store,
            router,
            sensor_db: storage.sensor_db.clone(),
            sensor_table: storage.sensor_table.clone(),
            initial_phase: config.pipeline.initial_phase,
            node_id: config.pipeline.node_id.clone(),
            retention: config.retention.clone(),
        })
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn router(&self) -> &PhaseRouter {
        &self.router
    }

    pub fn sensor_table(&self) -> &str {
        &self.sensor_table
    }

    // ========================================================================
    // Phase state
    // ========================================================================

    /// Current phase, applying the configured initial phase on first access.
    pub fn get_phase(&self) -> Result<PhaseConfig> {
        match self.store.get_current_phase() {
            Err(PipelineError::NotInitialized { .. }) => self.store.initialize_default(
                self.initial_phase,
                defaults::SYSTEM_ACTOR,
                defaults::INITIAL_PHASE_REASON,
            ),
            other => other,
        }
    }

    /// The single mutation entry point for phase state.
    ///
    /// Accepts canonical names and the unambiguous legacy aliases. An empty
    /// reason is stored as no reason.
    pub fn switch_phase(&self, phase: &str, actor: &str, reason: &str) -> Result<PhaseConfig> {
        let ctx = ErrorContext::new("switch_phase")
            .with_phase(phase)
            .with_actor(actor);
        let (resolved, aliased) = Phase::resolve_alias(phase).map_err(|e| {
            warn!(phase = %phase, actor = %actor, "Rejected phase switch");
            PipelineError::InvalidPhase {
                name: e.name,
                hint: e.hint,
                context: ctx.clone(),
            }
        })?;
        if aliased {
            warn!(alias = %phase, phase = %resolved, "Resolved legacy phase alias");
        }

        let reason = Some(reason.trim()).filter(|r| !r.is_empty());
        let previous = self.store.get_current_phase().ok().map(|c| c.phase);
        let applied = self.store.set_phase(resolved.as_str(), actor, reason)?;

        info!(
            from = ?previous.map(|p| p.as_str()),
            to = %applied.phase,
            actor = %actor,
            seq = applied.seq,
            "Phase switched"
        );

        if let Some(keep) = self.retention.history_keep {
            if let Err(e) = self.store.prune_history(keep) {
                warn!(error = %e, keep, "History retention failed");
            }
        }
        Ok(applied)
    }

    /// Up to `limit` phase snapshots, most recent first.
    pub fn get_history(&self, limit: usize) -> Result<Vec<PhaseConfig>> {
        self.store.get_history(limit)
    }

    // ========================================================================
    // Batch processing
    // ========================================================================

    /// Route `batch` under the current phase and record the run.
    ///
    /// A routing failure is recorded with `outcome = failure` before being
    /// returned. Phase state is never touched here beyond the lazy default.
    pub fn process_batch(&self, batch: &[SensorRecord]) -> Result<RoutingResult> {
        let phase = self.get_phase()?.phase;

        let routed = self.router.route(phase, batch);
        let record = self.execution_record(phase, batch.len(), &routed);

        match routed {
            Ok(result) => {
                let id = self.store.record_execution(&record)?;
                info!(
                    id,
                    phase = %phase,
                    records_in = record.records_in,
                    valid = record.records_routed_valid,
                    invalid = record.records_routed_invalid,
                    outcome = %record.outcome,
                    "Batch processed"
                );
                self.apply_execution_retention();
                Ok(result)
            }
            Err(err) => {
                error!(phase = %phase, records_in = batch.len(), error = %err, "Batch routing failed");
                if let Err(store_err) = self.store.record_execution(&record) {
                    error!(error = %store_err, "Failed to record failed batch");
                } else {
                    self.apply_execution_retention();
                }
                Err(err)
            }
        }
    }

    /// Up to `limit` execution records, most recent first.
    pub fn execution_history(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        self.store.execution_history(limit)
    }

    fn execution_record(
        &self,
        phase: Phase,
        records_in: usize,
        routed: &Result<RoutingResult>,
    ) -> ExecutionRecord {
        let (valid, invalid, destinations, outcome, error_detail) = match routed {
            Ok(r) => (
                r.valid_inputs,
                r.invalid_records.len(),
                r.destinations.to_vec(),
                if r.invalid_records.is_empty() {
                    ExecutionOutcome::Success
                } else {
                    ExecutionOutcome::Partial
                },
                None,
            ),
            Err(e) => (0, 0, Vec::new(), ExecutionOutcome::Failure, Some(e.to_string())),
        };
        ExecutionRecord {
            id: None,
            phase_at_time: phase,
            records_in,
            records_routed_valid: valid,
            records_routed_invalid: invalid,
            destinations,
            timestamp: Utc::now(),
            outcome,
            error_detail,
            node_id: self.node_id.clone(),
        }
    }

    fn apply_execution_retention(&self) {
        if let Some(keep) = self.retention.executions_keep {
            if let Err(e) = self.store.prune_executions(keep) {
                warn!(error = %e, keep, "Execution retention failed");
            }
        }
    }

    /// Trim the phase and execution logs to their `keep` most recent rows.
    pub fn prune(&self, history_keep: Option<usize>, executions_keep: Option<usize>) -> Result<PruneReport> {
        let history_removed = history_keep
            .map(|keep| self.store.prune_history(keep))
            .transpose()?;
        let executions_removed = executions_keep
            .map(|keep| self.store.prune_executions(keep))
            .transpose()?;
        Ok(PruneReport {
            history_removed,
            executions_removed,
        })
    }

    // ========================================================================
    // Operational source (read-only)
    // ========================================================================

    /// Open the sensor database with the requested access. Anything but
    /// `ReadOnly` is refused with `IsolationViolation`.
    pub fn operational_source(&self, mode: AccessMode) -> Result<OperationalSource> {
        let path = self.sensor_db.as_deref().ok_or_else(|| {
            PipelineError::configuration(
                "no sensor database configured (storage.sensor_db)",
                ErrorContext::new("operational_source"),
            )
        })?;
        OperationalSource::open(path, mode)
    }

    pub fn read_operational_data(&self, query: &OperationalQuery) -> Result<Vec<SensorRecord>> {
        self.operational_source(AccessMode::ReadOnly)?.read(query)
    }

    /// Up to `limit` rows of the configured sensor table.
    pub fn recent_sensor_data(&self, limit: usize) -> Result<Vec<SensorRecord>> {
        let query = OperationalQuery::table(self.sensor_table.as_str()).limit(limit);
        self.read_operational_data(&query.into())
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        self.operational_source(AccessMode::ReadOnly)?.list_tables()
    }

    pub fn table_info(&self, table: &str) -> Result<TableInfo> {
        self.operational_source(AccessMode::ReadOnly)?.table_info(table)
    }

    /// `false` when no sensor database is configured or it cannot be read.
    pub fn verify_connection(&self) -> bool {
        match self.operational_source(AccessMode::ReadOnly) {
            Ok(source) => source.verify_connection(),
            Err(e) => {
                warn!(error = %e, "Operational source unavailable");
                false
            }
        }
    }
}

/// Fail fast when both stores resolve to one physical file.
fn check_isolation(config_db: &Path, sensor_db: &Path) -> Result<()> {
    if same_storage(config_db, sensor_db) {
        error!(
            config_db = %config_db.display(),
            sensor_db = %sensor_db.display(),
            "Config store and sensor database are the same storage"
        );
        return Err(PipelineError::configuration(
            format!(
                "config store {} and sensor database {} resolve to the same storage",
                config_db.display(),
                sensor_db.display()
            ),
            ErrorContext::new("check_isolation"),
        ));
    }
    Ok(())
}
