//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Storage
// ============================================================================

/// Config store file name when nothing else is configured.
pub const CONFIG_DB_FILE: &str = "pipeline_config.db";

/// Table the sensor simulator writes into.
pub const SENSOR_TABLE: &str = "sensor_readings";

/// Schema version written to `store_meta`.
pub const STORE_SCHEMA_VERSION: i64 = 1;

// ============================================================================
// Retry / Backoff
// ============================================================================

/// Retries after the first attempt before a write gives up with `Locked`.
pub const RETRY_MAX_RETRIES: u32 = 5;

/// Delay before the first retry (ms). Doubles on every further attempt.
pub const RETRY_BASE_DELAY_MS: u64 = 100;

/// Upper bound for a single backoff delay (ms).
pub const RETRY_MAX_DELAY_MS: u64 = 2_000;

// ============================================================================
// Pipeline
// ============================================================================

/// Actor recorded when the controller applies the initial phase itself.
pub const SYSTEM_ACTOR: &str = "system";

/// Reason recorded for the lazily applied initial phase.
pub const INITIAL_PHASE_REASON: &str = "Initial configuration";

pub const NODE_ID: &str = "edge-node";

pub const PIPELINE_VERSION: &str = "0.9.0";

pub const SITE_ID: &str = "default_site";

/// Sea-level pressure (hPa) used by the turbine schema when a reading has none.
pub const DEFAULT_PRESSURE_HPA: f64 = 1013.25;

// ============================================================================
// Aggregation
// ============================================================================

/// Tumbling window length for the aggregated phase (seconds).
pub const AGGREGATION_WINDOW_SECS: u64 = 60;

/// Longest accepted aggregation window (366 days).
pub const AGGREGATION_MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// Field used to group records inside a window.
pub const AGGREGATION_GROUP_FIELD: &str = "location";

/// Group label for records without a group field.
pub const AGGREGATION_UNGROUPED: &str = "unassigned";

// ============================================================================
// Sinks (logical destination identifiers)
// ============================================================================

pub const SINK_INGESTION: &str = "ingestion-sink";
pub const SINK_VALIDATED: &str = "validated-sink";
pub const SINK_SCHEMATIZED: &str = "schematized-sink";
pub const SINK_AGGREGATED: &str = "aggregated-sink";
pub const SINK_ANOMALY: &str = "anomaly-sink";

// ============================================================================
// Operator CLI
// ============================================================================

/// Default number of rows shown by `history`, `executions` and `read-sensor`.
pub const CLI_LIST_LIMIT: usize = 10;

/// Poll interval for `monitor` (seconds).
pub const MONITOR_INTERVAL_SECS: u64 = 2;
