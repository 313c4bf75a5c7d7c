//! Phase definitions: what each phase does to a batch and where it goes
//!
//! The table is built once from the sink configuration and never mutated.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::SinkConfig;
use crate::error::{ErrorContext, PipelineError, Result};
use crate::types::Phase;

/// Processing step applied to each record before routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Processing {
    /// Passthrough
    None,
    /// Fixed-range checks per known field
    BasicValidate,
    /// Map onto the turbine schema, then range-check the result
    SchemaTransformValidate,
    /// Range-check, then summarize valid records per window
    Aggregate,
    /// Rule-based anomaly classifier
    AnomalyOnly,
}

impl Processing {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Processing::None => "none",
            Processing::BasicValidate => "basic-validate",
            Processing::SchemaTransformValidate => "schema-transform+validate",
            Processing::Aggregate => "aggregate",
            Processing::AnomalyOnly => "anomaly-only",
        }
    }

    /// Whether this step can send records to an invalid sink.
    pub const fn rejects(&self) -> bool {
        !matches!(self, Processing::None)
    }
}

impl std::fmt::Display for Processing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a phase sends its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RoutingMode {
    /// Everything to one sink
    Direct { sink: String },
    /// Valid records to one sink, invalid to another
    Split { valid: String, invalid: String },
}

impl RoutingMode {
    pub fn valid_sink(&self) -> &str {
        match self {
            RoutingMode::Direct { sink } => sink,
            RoutingMode::Split { valid, .. } => valid,
        }
    }

    pub fn invalid_sink(&self) -> Option<&str> {
        match self {
            RoutingMode::Direct { .. } => None,
            RoutingMode::Split { invalid, .. } => Some(invalid),
        }
    }

    pub const fn is_split(&self) -> bool {
        matches!(self, RoutingMode::Split { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub phase: Phase,
    pub processing: Processing,
    pub routing: RoutingMode,
}

/// Immutable phase to definition lookup.
#[derive(Debug, Clone)]
pub struct PhaseTable {
    definitions: HashMap<Phase, PhaseDefinition>,
}

impl PhaseTable {
    /// The five standard phases wired to the configured sinks.
    ///
    /// | phase       | processing                | valid sink  | invalid sink |
    /// |-------------|---------------------------|-------------|--------------|
    /// | raw         | none                      | ingestion   | -            |
    /// | validated   | basic-validate            | validated   | anomaly      |
    /// | schematized | schema-transform+validate | schematized | anomaly      |
    /// | aggregated  | aggregate                 | aggregated  | anomaly      |
    /// | anomaly     | anomaly-only              | ingestion   | anomaly      |
    pub fn standard(sinks: &SinkConfig) -> Self {
        let split = |valid: &str| RoutingMode::Split {
            valid: valid.to_string(),
            invalid: sinks.anomaly.clone(),
        };
        Self::collect([
            PhaseDefinition {
                phase: Phase::Raw,
                processing: Processing::None,
                routing: RoutingMode::Direct {
                    sink: sinks.ingestion.clone(),
                },
            },
            PhaseDefinition {
                phase: Phase::Validated,
                processing: Processing::BasicValidate,
                routing: split(&sinks.validated),
            },
            PhaseDefinition {
                phase: Phase::Schematized,
                processing: Processing::SchemaTransformValidate,
                routing: split(&sinks.schematized),
            },
            PhaseDefinition {
                phase: Phase::Aggregated,
                processing: Processing::Aggregate,
                routing: split(&sinks.aggregated),
            },
            PhaseDefinition {
                phase: Phase::Anomaly,
                processing: Processing::AnomalyOnly,
                routing: split(&sinks.ingestion),
            },
        ])
    }

    /// Build a table from explicit definitions. Later entries for the same
    /// phase replace earlier ones; phases left out have no definition.
    ///
    /// Direct routing has no invalid sink, so it only pairs with `none`
    /// processing. Any other pairing is a `Configuration` error.
    pub fn from_definitions(defs: impl IntoIterator<Item = PhaseDefinition>) -> Result<Self> {
        let defs: Vec<PhaseDefinition> = defs.into_iter().collect();
        if let Some(def) = defs
            .iter()
            .find(|d| d.processing.rejects() && !d.routing.is_split())
        {
            return Err(PipelineError::configuration(
                format!(
                    "phase '{}' uses {} processing but direct routing has no invalid sink",
                    def.phase, def.processing
                ),
                ErrorContext::new("build_phase_table").with_phase(def.phase.as_str()),
            ));
        }
        Ok(Self::collect(defs))
    }

    fn collect(defs: impl IntoIterator<Item = PhaseDefinition>) -> Self {
        Self {
            definitions: defs.into_iter().map(|d| (d.phase, d)).collect(),
        }
    }

    pub fn get(&self, phase: Phase) -> Option<&PhaseDefinition> {
        self.definitions.get(&phase)
    }

    /// Definitions in canonical phase order.
    pub fn iter(&self) -> impl Iterator<Item = &PhaseDefinition> {
        Phase::ALL.iter().filter_map(|p| self.definitions.get(p))
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
