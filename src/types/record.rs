//! Sensor record shapes
//!
//! Rows arrive from the operational store as untyped column maps
//! (`SensorRecord`). Every field access goes through a typed accessor that
//! returns a `FieldError` instead of guessing, so the router can classify a
//! malformed record as invalid rather than fail the batch.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::Phase;

// ============================================================================
// Untyped input record
// ============================================================================

/// One row of sensor data, column name to JSON value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorRecord(Map<String, Value>);

impl SensorRecord {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Builder-style insert, handy for fixtures and the operational reader.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Numeric field. `null` counts as missing; strings are never coerced.
    pub fn number(&self, field: &str) -> Result<f64, FieldError> {
        match self.0.get(field) {
            None | Some(Value::Null) => Err(FieldError::Missing {
                field: field.to_string(),
            }),
            Some(Value::Number(n)) => n.as_f64().ok_or_else(|| FieldError::WrongType {
                field: field.to_string(),
                expected: "number",
            }),
            Some(_) => Err(FieldError::WrongType {
                field: field.to_string(),
                expected: "number",
            }),
        }
    }

    /// Numeric field that may legitimately be absent.
    pub fn optional_number(&self, field: &str) -> Result<Option<f64>, FieldError> {
        match self.number(field) {
            Ok(v) => Ok(Some(v)),
            Err(FieldError::Missing { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Non-empty text field.
    pub fn text(&self, field: &str) -> Result<&str, FieldError> {
        match self.0.get(field) {
            None | Some(Value::Null) => Err(FieldError::Missing {
                field: field.to_string(),
            }),
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
            Some(Value::String(_)) => Err(FieldError::Missing {
                field: field.to_string(),
            }),
            Some(_) => Err(FieldError::WrongType {
                field: field.to_string(),
                expected: "string",
            }),
        }
    }

    /// Timestamp field: RFC 3339, naive ISO-8601 / SQL datetime (taken as
    /// UTC), or integer unix seconds.
    pub fn timestamp(&self, field: &str) -> Result<DateTime<Utc>, FieldError> {
        let value = match self.0.get(field) {
            None | Some(Value::Null) => {
                return Err(FieldError::Missing {
                    field: field.to_string(),
                })
            }
            Some(v) => v,
        };
        parse_timestamp(value).ok_or_else(|| FieldError::WrongType {
            field: field.to_string(),
            expected: "timestamp",
        })
    }
}

impl From<Map<String, Value>> for SensorRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Parse the timestamp encodings the sensor simulator has been seen to write.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

// ============================================================================
// Field access failures and violations
// ============================================================================

/// Why a field could not be read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("missing field '{field}'")]
    Missing { field: String },
    #[error("field '{field}' is not a {expected}")]
    WrongType { field: String, expected: &'static str },
}

/// Reason a record was routed to the invalid partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum Violation {
    MissingField {
        field: String,
    },
    WrongType {
        field: String,
        expected: String,
    },
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },
    Anomalous {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },
    TransformFailed {
        reason: String,
    },
}

impl From<FieldError> for Violation {
    fn from(err: FieldError) -> Self {
        match err {
            FieldError::Missing { field } => Violation::MissingField { field },
            FieldError::WrongType { field, expected } => Violation::WrongType {
                field,
                expected: expected.to_string(),
            },
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::MissingField { field } => write!(f, "{field}: missing"),
            Violation::WrongType { field, expected } => {
                write!(f, "{field}: expected {expected}")
            }
            Violation::OutOfRange {
                field,
                value,
                min,
                max,
            } => write!(f, "{field}: {value} outside [{min}, {max}]"),
            Violation::Anomalous {
                field,
                value,
                min,
                max,
            } => write!(f, "{field}: {value} anomalous (expected [{min}, {max}])"),
            Violation::TransformFailed { reason } => write!(f, "transform failed: {reason}"),
        }
    }
}

// ============================================================================
// Routed output shapes
// ============================================================================

/// Audit trail attached to every record a transforming phase emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMetadata {
    pub stage: Phase,
    pub pipeline_version: String,
    pub processed_at: DateTime<Utc>,
    pub node_id: String,
    pub transformation_hash: String,
}

/// Input record that passed the fixed-range checks, unchanged apart from the
/// attached metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedReading {
    #[serde(flatten)]
    pub record: SensorRecord,
    pub pipeline_metadata: PipelineMetadata,
}

/// Record mapped onto the wind-turbine target schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurbineReading {
    pub timestamp: DateTime<Utc>,
    pub turbine_id: String,
    pub site_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub voltage: Option<f64>,
    pub vibration: Option<f64>,
    pub wind_speed: Option<f64>,
    pub power_output: Option<f64>,
    pub pipeline_metadata: PipelineMetadata,
}

/// Summary statistics for one field within an aggregation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Sample standard deviation; `None` with fewer than two samples
    pub std_dev: Option<f64>,
}

/// One synthetic record per (group, window) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReading {
    pub group: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub sample_count: usize,
    pub fields: BTreeMap<String, FieldStats>,
    pub pipeline_metadata: PipelineMetadata,
}

/// Record in the valid partition of a routing result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputRecord {
    Raw(SensorRecord),
    Validated(ValidatedReading),
    Schematized(TurbineReading),
    Aggregate(AggregateReading),
}

impl OutputRecord {
    /// The untouched input for passthrough and validated records.
    pub fn source_record(&self) -> Option<&SensorRecord> {
        match self {
            OutputRecord::Raw(r) => Some(r),
            OutputRecord::Validated(v) => Some(&v.record),
            OutputRecord::Schematized(_) | OutputRecord::Aggregate(_) => None,
        }
    }

    pub fn metadata(&self) -> Option<&PipelineMetadata> {
        match self {
            OutputRecord::Raw(_) => None,
            OutputRecord::Validated(v) => Some(&v.pipeline_metadata),
            OutputRecord::Schematized(t) => Some(&t.pipeline_metadata),
            OutputRecord::Aggregate(a) => Some(&a.pipeline_metadata),
        }
    }
}

/// Record in the invalid partition. The original input is preserved so the
/// anomaly sink receives exactly what the producer wrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub record: SensorRecord,
    pub violations: Vec<Violation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_accessor() {
        let r = SensorRecord::new()
            .with("temperature", 22.5)
            .with("label", "hot")
            .with("nothing", Value::Null);

        assert_eq!(r.number("temperature").unwrap(), 22.5);
        assert!(matches!(r.number("label"), Err(FieldError::WrongType { .. })));
        assert!(matches!(r.number("nothing"), Err(FieldError::Missing { .. })));
        assert!(matches!(r.number("absent"), Err(FieldError::Missing { .. })));
        assert_eq!(r.optional_number("absent").unwrap(), None);
        assert!(r.optional_number("label").is_err());
    }

    #[test]
    fn test_text_accessor_rejects_blank() {
        let r = SensorRecord::new().with("location", "  ").with("id", 3);
        assert!(matches!(r.text("location"), Err(FieldError::Missing { .. })));
        assert!(matches!(r.text("id"), Err(FieldError::WrongType { .. })));
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        for raw in [
            json!("2024-01-15T10:30:00Z"),
            json!("2024-01-15T10:30:00"),
            json!("2024-01-15 10:30:00"),
            json!("2024-01-15T12:30:00+02:00"),
            json!(expected.timestamp()),
        ] {
            assert_eq!(parse_timestamp(&raw), Some(expected), "format {raw}");
        }
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(true)), None);
    }

    #[test]
    fn test_violation_from_field_error() {
        let v: Violation = FieldError::Missing {
            field: "humidity".into(),
        }
        .into();
        assert_eq!(
            v,
            Violation::MissingField {
                field: "humidity".into()
            }
        );
    }

    #[test]
    fn test_validated_reading_flattens_record() {
        let reading = ValidatedReading {
            record: SensorRecord::new().with("id", 1).with("humidity", 40.0),
            pipeline_metadata: PipelineMetadata {
                stage: Phase::Validated,
                pipeline_version: "0.9.0".into(),
                processed_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                node_id: "edge-1".into(),
                transformation_hash: "abc".into(),
            },
        };
        let value = serde_json::to_value(OutputRecord::Validated(reading)).unwrap();
        assert_eq!(value["kind"], "validated");
        assert_eq!(value["humidity"], 40.0);
        assert_eq!(value["pipeline_metadata"]["stage"], "validated");
    }
}
