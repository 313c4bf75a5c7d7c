//! Pipeline Configuration - operator-tunable control-plane settings
//!
//! Each struct implements `Default` with the documented values, so a missing
//! file or a partial file always yields a complete configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::defaults;
use crate::types::Phase;

/// Env var naming the TOML file to load.
pub const CONFIG_ENV_VAR: &str = "EDGE_PIPELINE_CONFIG";

/// File looked up in the working directory when the env var is unset.
pub const LOCAL_CONFIG_FILE: &str = "pipeline.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one edge node's pipeline control plane.
///
/// Load with `PipelineConfig::load()` which searches:
/// 1. `$EDGE_PIPELINE_CONFIG`
/// 2. `./pipeline.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Config store and operational source locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Lock-contention retry budget
    #[serde(default)]
    pub retry: RetryConfig,

    /// Node identity and initial phase
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Logical destination identifiers handed back to the uploader
    #[serde(default)]
    pub sinks: SinkConfig,

    /// Fixed-range checks for the validated/schematized/aggregated phases
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Classifier rules for the anomaly phase
    #[serde(default)]
    pub anomaly: AnomalyConfig,

    /// Window and grouping for the aggregated phase
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Optional caps on history and execution rows
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl PipelineConfig {
    /// Load configuration using the standard search order:
    /// 1. `$EDGE_PIPELINE_CONFIG` environment variable
    /// 2. `./pipeline.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), node = %config.pipeline.node_id, "Loaded pipeline config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        // 2. Check ./pipeline.toml
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(node = %config.pipeline.node_id, "Loaded pipeline config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        // 3. Defaults
        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate a TOML document. Unknown keys are warnings only.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self = toml::from_str(contents)
            .map_err(|e| ConfigError::Parse(PathBuf::from("<inline>"), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate all sections for internal consistency.
    ///
    /// Rules:
    /// - Bounds and anomaly rules: finite, `min <= max`, one rule per field
    /// - Retry delays positive, `max_delay_ms >= base_delay_ms`
    /// - Aggregation window and field list non-empty
    /// - Sink identifiers and the config store path non-empty
    /// - Retention caps, when set, are > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.storage.config_db.as_os_str().is_empty() {
            errors.push("storage.config_db must not be empty".to_string());
        }
        if let Some(ref sensor_db) = self.storage.sensor_db {
            if sensor_db == &self.storage.config_db {
                errors.push(format!(
                    "storage.sensor_db and storage.config_db must be different files (both are {})",
                    sensor_db.display()
                ));
            }
        }
        if !super::validation::is_identifier(&self.storage.sensor_table) {
            errors.push(format!(
                "storage.sensor_table '{}' is not a valid table name",
                self.storage.sensor_table
            ));
        }

        let r = &self.retry;
        if r.base_delay_ms == 0 {
            errors.push("retry.base_delay_ms must be > 0".to_string());
        }
        if r.max_delay_ms < r.base_delay_ms {
            errors.push(format!(
                "retry.max_delay_ms ({}) must be >= base_delay_ms ({})",
                r.max_delay_ms, r.base_delay_ms
            ));
        }
        if r.operation_timeout_ms == Some(0) {
            errors.push("retry.operation_timeout_ms must be > 0 when set".to_string());
        }

        if self.pipeline.node_id.trim().is_empty() {
            errors.push("pipeline.node_id must not be empty".to_string());
        }

        for (name, sink) in self.sinks.named() {
            if sink.trim().is_empty() {
                errors.push(format!("sinks.{name} must not be empty"));
            }
        }

        Self::check_bounds("validation.bounds", &self.validation.bounds, &mut errors);
        Self::check_bounds("anomaly.rules", &self.anomaly.rules, &mut errors);

        let a = &self.aggregation;
        if a.window_secs == 0 {
            errors.push("aggregation.window_secs must be > 0".to_string());
        } else if a.window_secs > defaults::AGGREGATION_MAX_WINDOW_SECS {
            errors.push(format!(
                "aggregation.window_secs must be <= {} (got {})",
                defaults::AGGREGATION_MAX_WINDOW_SECS,
                a.window_secs
            ));
        }
        if a.group_field.trim().is_empty() {
            errors.push("aggregation.group_field must not be empty".to_string());
        }
        if a.fields.is_empty() {
            errors.push("aggregation.fields must list at least one field".to_string());
        }

        if self.retention.history_keep == Some(0) {
            errors.push("retention.history_keep must be > 0 when set".to_string());
        }
        if self.retention.executions_keep == Some(0) {
            errors.push("retention.executions_keep must be > 0 when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn check_bounds(section: &str, bounds: &[FieldBound], errors: &mut Vec<String>) {
        let mut seen = std::collections::HashSet::new();
        for b in bounds {
            if b.field.trim().is_empty() {
                errors.push(format!("{section}: field name must not be empty"));
                continue;
            }
            if !seen.insert(b.field.as_str()) {
                errors.push(format!("{section}: duplicate rule for '{}'", b.field));
            }
            // NaN/Inf comparisons silently pass, catch them explicitly
            if !b.min.is_finite() || !b.max.is_finite() {
                errors.push(format!(
                    "{section}.{}: bounds must be finite (got min={}, max={})",
                    b.field, b.min, b.max
                ));
                continue;
            }
            if b.min > b.max {
                errors.push(format!(
                    "{section}.{}: min ({}) must be <= max ({})",
                    b.field, b.min, b.max
                ));
            }
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite file owned by the control plane (phase history, executions).
    #[serde(default = "default_config_db")]
    pub config_db: PathBuf,

    /// Operational sensor database, opened read-only. Optional: only
    /// `read_operational_data` needs it.
    #[serde(default)]
    pub sensor_db: Option<PathBuf>,

    /// Table the simulator writes readings into.
    #[serde(default = "default_sensor_table")]
    pub sensor_table: String,
}

fn default_config_db() -> PathBuf {
    PathBuf::from(defaults::CONFIG_DB_FILE)
}

fn default_sensor_table() -> String {
    defaults::SENSOR_TABLE.to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            config_db: default_config_db(),
            sensor_db: None,
            sensor_table: default_sensor_table(),
        }
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Bounded exponential backoff for lock contention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay; doubles per attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap for any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Overall budget per operation. When exceeded the operation fails with
    /// `Timeout` even if retries remain.
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,
}

fn default_max_retries() -> u32 { defaults::RETRY_MAX_RETRIES }
fn default_base_delay_ms() -> u64 { defaults::RETRY_BASE_DELAY_MS }
fn default_max_delay_ms() -> u64 { defaults::RETRY_MAX_DELAY_MS }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            operation_timeout_ms: None,
        }
    }
}

// ============================================================================
// Pipeline Settings
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Phase applied lazily the first time a fresh store is read.
    #[serde(default = "default_initial_phase")]
    pub initial_phase: Phase,

    /// Identifier of this edge node, stamped on metadata and executions.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Version stamped on pipeline metadata; feeds the transformation hash.
    #[serde(default = "default_pipeline_version")]
    pub pipeline_version: String,

    /// Site identifier written into turbine-schema records.
    #[serde(default = "default_site_id")]
    pub site_id: String,
}

fn default_initial_phase() -> Phase { Phase::Raw }
fn default_node_id() -> String { defaults::NODE_ID.to_string() }
fn default_pipeline_version() -> String { defaults::PIPELINE_VERSION.to_string() }
fn default_site_id() -> String { defaults::SITE_ID.to_string() }

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            initial_phase: default_initial_phase(),
            node_id: default_node_id(),
            pipeline_version: default_pipeline_version(),
            site_id: default_site_id(),
        }
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Logical destination names. The uploader maps these onto real buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_ingestion")]
    pub ingestion: String,
    #[serde(default = "default_sink_validated")]
    pub validated: String,
    #[serde(default = "default_sink_schematized")]
    pub schematized: String,
    #[serde(default = "default_sink_aggregated")]
    pub aggregated: String,
    #[serde(default = "default_sink_anomaly")]
    pub anomaly: String,
}

fn default_sink_ingestion() -> String { defaults::SINK_INGESTION.to_string() }
fn default_sink_validated() -> String { defaults::SINK_VALIDATED.to_string() }
fn default_sink_schematized() -> String { defaults::SINK_SCHEMATIZED.to_string() }
fn default_sink_aggregated() -> String { defaults::SINK_AGGREGATED.to_string() }
fn default_sink_anomaly() -> String { defaults::SINK_ANOMALY.to_string() }

impl SinkConfig {
    fn named(&self) -> [(&'static str, &str); 5] {
        [
            ("ingestion", &self.ingestion),
            ("validated", &self.validated),
            ("schematized", &self.schematized),
            ("aggregated", &self.aggregated),
            ("anomaly", &self.anomaly),
        ]
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            ingestion: default_sink_ingestion(),
            validated: default_sink_validated(),
            schematized: default_sink_schematized(),
            aggregated: default_sink_aggregated(),
            anomaly: default_sink_anomaly(),
        }
    }
}

// ============================================================================
// Field Bounds (validation + anomaly rules)
// ============================================================================

/// Inclusive numeric range for one record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldBound {
    pub field: String,
    pub min: f64,
    pub max: f64,
    /// Missing or non-numeric values are violations when set; otherwise the
    /// check only runs when the field is present.
    #[serde(default)]
    pub required: bool,
}

impl FieldBound {
    pub fn new(field: &str, min: f64, max: f64, required: bool) -> Self {
        Self {
            field: field.to_string(),
            min,
            max,
            required,
        }
    }

    /// Inclusive on both ends; NaN is never contained.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_validation_bounds")]
    pub bounds: Vec<FieldBound>,
}

fn default_validation_bounds() -> Vec<FieldBound> {
    vec![
        FieldBound::new("temperature", -20.0, 60.0, true),
        FieldBound::new("humidity", 0.0, 100.0, true),
        FieldBound::new("pressure", 800.0, 1200.0, false),
        FieldBound::new("voltage", 0.0, 30.0, false),
        FieldBound::new("vibration", 0.0, 50.0, false),
    ]
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            bounds: default_validation_bounds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    #[serde(default = "default_anomaly_rules")]
    pub rules: Vec<FieldBound>,
}

fn default_anomaly_rules() -> Vec<FieldBound> {
    vec![
        FieldBound::new("temperature", -10.0, 50.0, true),
        FieldBound::new("humidity", 5.0, 95.0, false),
        FieldBound::new("vibration", 0.0, 10.0, false),
        FieldBound::new("voltage", 10.5, 13.5, false),
    ]
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            rules: default_anomaly_rules(),
        }
    }
}

// ============================================================================
// Aggregation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Tumbling window length; window start = timestamp floored to a multiple.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Field naming the group inside a window (e.g. turbine location).
    #[serde(default = "default_group_field")]
    pub group_field: String,

    /// Numeric fields summarized per window.
    #[serde(default = "default_aggregate_fields")]
    pub fields: Vec<String>,
}

fn default_window_secs() -> u64 { defaults::AGGREGATION_WINDOW_SECS }
fn default_group_field() -> String { defaults::AGGREGATION_GROUP_FIELD.to_string() }
fn default_aggregate_fields() -> Vec<String> {
    ["temperature", "humidity", "pressure", "voltage", "vibration"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            group_field: default_group_field(),
            fields: default_aggregate_fields(),
        }
    }
}

// ============================================================================
// Retention
// ============================================================================

/// Row caps applied after each successful write. `None` keeps everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default)]
    pub history_keep: Option<usize>,
    #[serde(default)]
    pub executions_keep: Option<usize>,
}

// ============================================================================
// Tests
// ============================================================================
