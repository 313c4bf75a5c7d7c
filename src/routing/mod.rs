//! PhaseRouter - maps (phase, batch) to a routing decision
//!
//! Pure and side-effect free: no I/O, no shared state. The phase table and
//! rule set are fixed at construction.
//!
//! ## Completeness
//!
//! Every input record is classified exactly once:
//! `valid_inputs + invalid_records.len() == batch.len()` for every phase.
//! For all phases except `aggregated`, `valid_records.len() == valid_inputs`;
//! the aggregated phase emits one summary per (group, window) instead.

pub mod aggregate;
pub mod anomaly;
pub mod definitions;
pub mod schema;
pub mod validate;

pub use definitions::{PhaseDefinition, PhaseTable, Processing, RoutingMode};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::config::{AggregationConfig, FieldBound, PipelineConfig};
use crate::error::{ErrorContext, PipelineError, Result};
use crate::types::{
    OutputRecord, Phase, PipelineMetadata, RejectedRecord, SensorRecord, ValidatedReading,
    Violation,
};

/// Logical sinks a routing result is bound for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destinations {
    pub valid: String,
    /// `None` for direct routing
    pub invalid: Option<String>,
}

impl Destinations {
    fn from_mode(mode: &RoutingMode) -> Self {
        Self {
            valid: mode.valid_sink().to_string(),
            invalid: mode.invalid_sink().map(str::to_string),
        }
    }

    pub fn to_vec(&self) -> Vec<String> {
        std::iter::once(self.valid.clone())
            .chain(self.invalid.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingResult {
    pub phase: Phase,
    /// Output for the valid sink, in batch order
    pub valid_records: Vec<OutputRecord>,
    /// Originals for the invalid sink, in batch order
    pub invalid_records: Vec<RejectedRecord>,
    /// Input records classified valid
    pub valid_inputs: usize,
    pub destinations: Destinations,
    pub applied_transform: Processing,
}

impl RoutingResult {
    /// Number of input records this result accounts for.
    pub fn classified(&self) -> usize {
        self.valid_inputs + self.invalid_records.len()
    }
}

/// Rule set shared by the processing steps.
#[derive(Debug, Clone)]
pub struct RoutingRules {
    pub validation: Vec<FieldBound>,
    pub anomaly: Vec<FieldBound>,
    pub aggregation: AggregationConfig,
    pub site_id: String,
    pub node_id: String,
    pub pipeline_version: String,
}

impl RoutingRules {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            validation: config.validation.bounds.clone(),
            anomaly: config.anomaly.rules.clone(),
            aggregation: config.aggregation.clone(),
            site_id: config.pipeline.site_id.clone(),
            node_id: config.pipeline.node_id.clone(),
            pipeline_version: config.pipeline.pipeline_version.clone(),
        }
    }
}

impl Default for RoutingRules {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct PhaseRouter {
    table: PhaseTable,
    rules: RoutingRules,
    hashes: HashMap<Phase, String>,
}

impl PhaseRouter {
    pub fn new(table: PhaseTable, rules: RoutingRules) -> Self {
        let hashes = table
            .iter()
            .filter_map(|def| {
                transformation_hash(def.phase, def.processing, &rules).map(|h| (def.phase, h))
            })
            .collect();
        Self {
            table,
            rules,
            hashes,
        }
    }

    /// Standard phase table and rules from a loaded configuration.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            PhaseTable::standard(&config.sinks),
            RoutingRules::from_config(config),
        )
    }

    pub fn table(&self) -> &PhaseTable {
        &self.table
    }

    pub fn rules(&self) -> &RoutingRules {
        &self.rules
    }

    /// Hash stamped on metadata for `phase`; `None` for passthrough phases.
    pub fn transformation_hash(&self, phase: Phase) -> Option<&str> {
        self.hashes.get(&phase).map(String::as_str)
    }

    pub fn route(&self, phase: Phase, batch: &[SensorRecord]) -> Result<RoutingResult> {
        self.route_at(phase, batch, Utc::now())
    }

    /// `route` with an explicit processing time for the metadata.
    pub fn route_at(
        &self,
        phase: Phase,
        batch: &[SensorRecord],
        processed_at: DateTime<Utc>,
    ) -> Result<RoutingResult> {
        let def = self
            .table
            .get(phase)
            .ok_or_else(|| PipelineError::UnknownPhase {
                phase: phase.to_string(),
                context: ErrorContext::new("route").with_phase(phase.as_str()),
            })?;

        let metadata = PipelineMetadata {
            stage: phase,
            pipeline_version: self.rules.pipeline_version.clone(),
            processed_at,
            node_id: self.rules.node_id.clone(),
            transformation_hash: self.transformation_hash(phase).unwrap_or_default().to_string(),
        };

        let mut valid_records = Vec::with_capacity(batch.len());
        let mut invalid_records = Vec::new();
        let mut valid_inputs = 0;
        let mut reject = |record: &SensorRecord, violations: Vec<Violation>| {
            invalid_records.push(RejectedRecord {
                record: record.clone(),
                violations,
            });
        };

        match def.processing {
            Processing::None => {
                valid_records.extend(batch.iter().cloned().map(OutputRecord::Raw));
                valid_inputs = batch.len();
            }
            Processing::BasicValidate => {
                for record in batch {
                    match validate::check_bounds(record, &self.rules.validation) {
                        Ok(()) => {
                            valid_inputs += 1;
                            valid_records.push(OutputRecord::Validated(ValidatedReading {
                                record: record.clone(),
                                pipeline_metadata: metadata.clone(),
                            }));
                        }
                        Err(violations) => reject(record, violations),
                    }
                }
            }
            Processing::SchemaTransformValidate => {
                for record in batch {
                    match schema::to_turbine(
                        record,
                        &self.rules.site_id,
                        &self.rules.validation,
                        metadata.clone(),
                    ) {
                        Ok(reading) => {
                            valid_inputs += 1;
                            valid_records.push(OutputRecord::Schematized(reading));
                        }
                        Err(violations) => reject(record, violations),
                    }
                }
            }
            Processing::Aggregate => {
                let window_secs = self.rules.aggregation.window_secs;
                let mut accepted = Vec::new();
                for record in batch {
                    let mut violations = validate::check_bounds(record, &self.rules.validation)
                        .err()
                        .unwrap_or_default();
                    match record.timestamp("timestamp") {
                        Ok(ts) => match aggregate::Window::containing(ts, window_secs) {
                            Some(window) if violations.is_empty() => accepted.push((record, window)),
                            Some(_) => reject(record, violations),
                            None => {
                                violations.push(Violation::TransformFailed {
                                    reason: format!(
                                        "no {window_secs}s aggregation window for timestamp {}",
                                        ts.to_rfc3339()
                                    ),
                                });
                                reject(record, violations);
                            }
                        },
                        Err(e) => {
                            violations.push(e.into());
                            reject(record, violations);
                        }
                    }
                }
                valid_inputs = accepted.len();
                valid_records.extend(
                    aggregate::aggregate(&accepted, &self.rules.aggregation, &metadata)
                        .into_iter()
                        .map(OutputRecord::Aggregate),
                );
            }
            Processing::AnomalyOnly => {
                for record in batch {
                    let flags = anomaly::classify(record, &self.rules.anomaly);
                    if flags.is_empty() {
                        valid_inputs += 1;
                        valid_records.push(OutputRecord::Raw(record.clone()));
                    } else {
                        reject(record, flags);
                    }
                }
            }
        }

        let result = RoutingResult {
            phase,
            valid_records,
            invalid_records,
            valid_inputs,
            destinations: Destinations::from_mode(&def.routing),
            applied_transform: def.processing,
        };
        debug!(
            phase = %phase,
            batch = batch.len(),
            valid = result.valid_inputs,
            invalid = result.invalid_records.len(),
            "Batch routed"
        );
        Ok(result)
    }
}

/// MD5 over the phase, pipeline version and the sorted rule keys the phase
/// depends on. Passthrough phases have no hash.
fn transformation_hash(phase: Phase, processing: Processing, rules: &RoutingRules) -> Option<String> {
    let bound_fields = rules.validation.iter().map(|b| b.field.clone());
    let keys: BTreeSet<String> = match processing {
        Processing::None | Processing::AnomalyOnly => return None,
        Processing::BasicValidate => bound_fields.collect(),
        Processing::SchemaTransformValidate => bound_fields
            .chain(["site_id", "timestamp", "turbine_id"].map(String::from))
            .collect(),
        Processing::Aggregate => bound_fields
            .chain(rules.aggregation.fields.iter().cloned())
            .chain(["group_field", "window_secs"].map(String::from))
            .collect(),
    };
    let definition = serde_json::json!({
        "config_keys": keys,
        "pipeline_type": phase.as_str(),
        "version": rules.pipeline_version,
    });
    Some(format!("{:x}", md5::compute(definition.to_string().as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;
    use chrono::TimeZone;

    fn router() -> PhaseRouter {
        PhaseRouter::from_config(&PipelineConfig::default())
    }

    fn reading(id: i64, temperature: f64, humidity: f64) -> SensorRecord {
        SensorRecord::new()
            .with("id", id)
            .with("timestamp", "2024-01-15T10:30:00Z")
            .with("location", "turbine_001")
            .with("temperature", temperature)
            .with("humidity", humidity)
    }

    fn ids(records: &[OutputRecord]) -> Vec<i64> {
        records
            .iter()
            .filter_map(|r| r.source_record())
            .filter_map(|r| r.get("id").and_then(serde_json::Value::as_i64))
            .collect()
    }

    #[test]
    fn test_raw_is_direct_passthrough() {
        let batch = vec![reading(1, 500.0, -3.0), SensorRecord::new()];
        let result = router().route(Phase::Raw, &batch).unwrap();
        assert_eq!(result.valid_records.len(), 2);
        assert!(result.invalid_records.is_empty());
        assert_eq!(result.destinations.to_vec(), vec!["ingestion-sink"]);
        assert!(result.valid_records.iter().all(|r| r.metadata().is_none()));
        assert_eq!(result.applied_transform, Processing::None);
    }

    #[test]
    fn test_validated_split_preserves_order() {
        let batch = vec![
            reading(1, 20.0, 40.0),
            reading(2, 21.0, 150.0),
            reading(3, 22.0, 60.0),
        ];
        let result = router().route(Phase::Validated, &batch).unwrap();
        assert_eq!(ids(&result.valid_records), vec![1, 3]);
        assert_eq!(result.invalid_records.len(), 1);
        assert_eq!(result.invalid_records[0].record, batch[1]);
        assert_eq!(
            result.destinations.to_vec(),
            vec!["validated-sink", "anomaly-sink"]
        );
        let meta = result.valid_records[0].metadata().unwrap();
        assert_eq!(meta.stage, Phase::Validated);
        assert_eq!(meta.transformation_hash.len(), 32);
    }

    #[test]
    fn test_schematized_emits_transformed_records() {
        let batch = vec![reading(1, 20.0, 40.0), SensorRecord::new().with("id", 2)];
        let result = router().route(Phase::Schematized, &batch).unwrap();
        assert_eq!(result.valid_records.len(), 1);
        match &result.valid_records[0] {
            OutputRecord::Schematized(t) => {
                assert_eq!(t.turbine_id, "turbine_001");
                assert_eq!(t.site_id, "default_site");
            }
            other => panic!("expected turbine reading, got {other:?}"),
        }
        assert_eq!(result.invalid_records.len(), 1);
    }

    #[test]
    fn test_aggregated_counts_inputs_not_outputs() {
        let batch = vec![
            reading(1, 20.0, 40.0),
            reading(2, 22.0, 42.0),
            reading(3, 99.0, 40.0),
            SensorRecord::new().with("temperature", 20.0).with("humidity", 40.0),
        ];
        let result = router().route(Phase::Aggregated, &batch).unwrap();
        assert_eq!(result.valid_inputs, 2);
        assert_eq!(result.invalid_records.len(), 2);
        assert_eq!(result.classified(), batch.len());
        assert_eq!(result.valid_records.len(), 1);
        let OutputRecord::Aggregate(agg) = &result.valid_records[0] else {
            panic!("expected aggregate");
        };
        assert_eq!(agg.sample_count, 2);
        assert!(matches!(
            result.invalid_records[1].violations.last(),
            Some(Violation::MissingField { field }) if field == "timestamp"
        ));
    }

    #[test]
    fn test_aggregated_rejects_timestamp_without_window() {
        let edge = reading(1, 20.0, 40.0).with("timestamp", 8_210_266_876_799_i64);
        let batch = vec![edge, reading(2, 21.0, 41.0)];
        let result = router().route(Phase::Aggregated, &batch).unwrap();
        assert_eq!(result.classified(), batch.len());
        assert_eq!(result.valid_inputs, 1);
        assert_eq!(result.invalid_records[0].record, batch[0]);
        assert!(matches!(
            result.invalid_records[0].violations.as_slice(),
            [Violation::TransformFailed { .. }]
        ));
    }

    #[test]
    fn test_anomaly_phase_leaves_normal_records_untouched() {
        let batch = vec![reading(1, 20.0, 40.0), reading(2, 55.0, 40.0)];
        let result = router().route(Phase::Anomaly, &batch).unwrap();
        assert_eq!(result.valid_records, vec![OutputRecord::Raw(batch[0].clone())]);
        assert_eq!(result.invalid_records[0].record, batch[1]);
        assert_eq!(result.destinations.valid, "ingestion-sink");
        assert_eq!(result.destinations.invalid.as_deref(), Some("anomaly-sink"));
    }

    #[test]
    fn test_empty_batch_every_phase() {
        let router = router();
        for phase in Phase::ALL {
            let result = router.route(phase, &[]).unwrap();
            assert!(result.valid_records.is_empty(), "{phase}");
            assert!(result.invalid_records.is_empty(), "{phase}");
        }
    }

    #[test]
    fn test_unknown_phase() {
        let router = PhaseRouter::new(
            PhaseTable::from_definitions([PhaseTable::standard(&SinkConfig::default())
                .get(Phase::Raw)
                .unwrap()
                .clone()])
            .unwrap(),
            RoutingRules::default(),
        );
        let err = router.route(Phase::Validated, &[]).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownPhase { ref phase, .. } if phase == "validated"));
        assert_eq!(err.context().phase.as_deref(), Some("validated"));
    }

    #[test]
    fn test_route_at_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let batch = vec![reading(1, 20.0, 40.0)];
        let a = router().route_at(Phase::Validated, &batch, at).unwrap();
        let b = router().route_at(Phase::Validated, &batch, at).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_depends_on_rules() {
        let base = router();
        assert!(base.transformation_hash(Phase::Raw).is_none());
        assert!(base.transformation_hash(Phase::Anomaly).is_none());
        assert_ne!(
            base.transformation_hash(Phase::Validated),
            base.transformation_hash(Phase::Schematized)
        );

        let mut config = PipelineConfig::default();
        config.pipeline.pipeline_version = "1.0.0".into();
        let bumped = PhaseRouter::from_config(&config);
        assert_ne!(
            base.transformation_hash(Phase::Validated),
            bumped.transformation_hash(Phase::Validated)
        );
    }
}
