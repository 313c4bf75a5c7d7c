//! Shared data structures for the pipeline control plane
//!
//! - `Phase`: the named operating mode of the pipeline
//! - `PhaseConfig`: one immutable snapshot in the phase history
//! - `ExecutionRecord`: audit entry for one batch-processing run
//! - `record`: sensor record shapes flowing through the router

pub mod record;

pub use record::{
    AggregateReading, FieldError, FieldStats, OutputRecord, PipelineMetadata, RejectedRecord,
    SensorRecord, TurbineReading, ValidatedReading, Violation,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// Phase
// ============================================================================

/// Operating mode of the pipeline.
///
/// The set is closed: every stored phase must parse back into one of these
/// five identifiers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No processing, everything goes to the ingestion sink
    Raw,
    /// Fixed-range checks, split valid/invalid
    Validated,
    /// Structural transform to the turbine schema, then validate
    Schematized,
    /// Validate, drop invalid inputs from the aggregate, one record per window
    Aggregated,
    /// Rule-based anomaly classifier, flagged records to the anomaly sink
    Anomaly,
}

impl Phase {
    /// Every canonical phase in declaration order.
    pub const ALL: [Phase; 5] = [
        Phase::Raw,
        Phase::Validated,
        Phase::Schematized,
        Phase::Aggregated,
        Phase::Anomaly,
    ];

    /// Canonical identifier as persisted in the config store.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Phase::Raw => "raw",
            Phase::Validated => "validated",
            Phase::Schematized => "schematized",
            Phase::Aggregated => "aggregated",
            Phase::Anomaly => "anomaly",
        }
    }

    /// Resolve an operator-supplied name, accepting the legacy aliases seen in
    /// older deployment scripts.
    ///
    /// Returns the phase and whether an alias was used. Names whose meaning
    /// differs between scripts are rejected instead of guessed.
    pub fn resolve_alias(name: &str) -> Result<(Phase, bool), PhaseParseError> {
        let normalized = name.trim().to_ascii_lowercase();
        if let Ok(phase) = normalized.parse::<Phase>() {
            return Ok((phase, false));
        }
        match normalized.as_str() {
            "ingestion" => Ok((Phase::Raw, true)),
            "anomalies" => Ok((Phase::Anomaly, true)),
            "enriched" | "filtered" | "anomaly_aggregated" => Err(PhaseParseError {
                name: name.to_string(),
                hint: Some(
                    "ambiguous legacy phase name; pick one of raw, validated, schematized, aggregated, anomaly"
                        .to_string(),
                ),
            }),
            _ => Err(PhaseParseError {
                name: name.to_string(),
                hint: None,
            }),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = PhaseParseError;

    /// Strict parse: canonical identifiers only, no aliases, no case folding.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Phase::Raw),
            "validated" => Ok(Phase::Validated),
            "schematized" => Ok(Phase::Schematized),
            "aggregated" => Ok(Phase::Aggregated),
            "anomaly" => Ok(Phase::Anomaly),
            other => Err(PhaseParseError {
                name: other.to_string(),
                hint: None,
            }),
        }
    }
}

/// A name that is not one of the canonical phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseParseError {
    pub name: String,
    pub hint: Option<String>,
}

impl std::fmt::Display for PhaseParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' is not a pipeline phase", self.name)?;
        if let Some(ref hint) = self.hint {
            write!(f, " ({hint})")?;
        }
        Ok(())
    }
}

impl std::error::Error for PhaseParseError {}

// ============================================================================
// Phase Configuration
// ============================================================================

/// One committed phase switch.
///
/// Rows are append-only; `seq` is assigned by the store and strictly
/// increases with commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub seq: i64,
    pub phase: Phase,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    pub reason: Option<String>,
}

// ============================================================================
// Execution Records
// ============================================================================

/// Outcome of one batch-processing run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Every input record was classified valid
    Success,
    /// Routed, but at least one input landed in the invalid partition
    Partial,
    /// Routing itself failed; nothing was handed to the sinks
    Failure,
}

impl ExecutionOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::Partial => "partial",
            ExecutionOutcome::Failure => "failure",
        }
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExecutionOutcome::Success),
            "partial" => Ok(ExecutionOutcome::Partial),
            "failure" => Ok(ExecutionOutcome::Failure),
            other => Err(format!("unknown execution outcome '{other}'")),
        }
    }
}

/// Audit entry summarizing one `process_batch` invocation.
///
/// `id` is `None` until the store has persisted the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Option<i64>,
    pub phase_at_time: Phase,
    pub records_in: usize,
    pub records_routed_valid: usize,
    pub records_routed_invalid: usize,
    pub destinations: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
    pub error_detail: Option<String>,
    pub node_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_roundtrip_through_str() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
    }

    #[test]
    fn test_strict_parse_rejects_aliases() {
        assert!("ingestion".parse::<Phase>().is_err());
        assert!("RAW".parse::<Phase>().is_err());
        assert!("not-a-real-phase".parse::<Phase>().is_err());
    }

    #[test]
    fn test_resolve_alias() {
        assert_eq!(Phase::resolve_alias("validated").unwrap(), (Phase::Validated, false));
        assert_eq!(Phase::resolve_alias(" Raw ").unwrap(), (Phase::Raw, false));
        assert_eq!(Phase::resolve_alias("ingestion").unwrap(), (Phase::Raw, true));
        assert_eq!(Phase::resolve_alias("anomalies").unwrap(), (Phase::Anomaly, true));
    }

    #[test]
    fn test_ambiguous_alias_carries_hint() {
        let err = Phase::resolve_alias("filtered").unwrap_err();
        assert!(err.hint.is_some());
        assert!(err.to_string().contains("ambiguous"));

        let err = Phase::resolve_alias("bogus").unwrap_err();
        assert!(err.hint.is_none());
    }

    #[test]
    fn test_phase_serde_uses_canonical_names() {
        let json = serde_json::to_string(&Phase::Schematized).unwrap();
        assert_eq!(json, "\"schematized\"");
    }

    #[test]
    fn test_outcome_parse() {
        assert_eq!("partial".parse::<ExecutionOutcome>().unwrap(), ExecutionOutcome::Partial);
        assert!("done".parse::<ExecutionOutcome>().is_err());
    }
}
