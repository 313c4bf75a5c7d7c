//! Structural transform onto the wind-turbine target schema
//!
//! Field mapping:
//! - `turbine_id`: `turbine_id`, else `location`, else `sensor_id`, else
//!   `turbine_{id}`
//! - `timestamp`, `temperature`, `humidity`: required
//! - `pressure`: defaults to standard sea-level pressure when absent
//! - `site_id`: record value, else the configured site
//! - `voltage`, `vibration`, `wind_speed`, `power_output`: carried when present
//!
//! The transformed reading is then range-checked like any other record.

use serde_json::Value;

use super::validate::check_bounds;
use crate::config::{defaults, FieldBound};
use crate::types::{FieldError, PipelineMetadata, SensorRecord, TurbineReading, Violation};

const OPTIONAL_FIELDS: [&str; 4] = ["voltage", "vibration", "wind_speed", "power_output"];

/// Map `record` onto the turbine schema and validate the result.
pub fn to_turbine(
    record: &SensorRecord,
    site_id: &str,
    bounds: &[FieldBound],
    metadata: PipelineMetadata,
) -> Result<TurbineReading, Vec<Violation>> {
    let mut violations = Vec::new();
    let mut take = |r: Result<f64, FieldError>| match r {
        Ok(v) => v,
        Err(e) => {
            violations.push(Violation::from(e));
            f64::NAN
        }
    };

    let temperature = take(record.number("temperature"));
    let humidity = take(record.number("humidity"));
    let pressure = take(
        record
            .optional_number("pressure")
            .map(|p| p.unwrap_or(defaults::DEFAULT_PRESSURE_HPA)),
    );

    let mut optional = [None; 4];
    for (slot, field) in optional.iter_mut().zip(OPTIONAL_FIELDS) {
        match record.optional_number(field) {
            Ok(v) => *slot = v,
            Err(e) => violations.push(e.into()),
        }
    }

    let timestamp = record
        .timestamp("timestamp")
        .map_err(|e| violations.push(e.into()))
        .ok();

    let turbine_id = turbine_id(record);
    if turbine_id.is_none() {
        violations.push(Violation::TransformFailed {
            reason: "no turbine identifier (turbine_id, location, sensor_id or id)".to_string(),
        });
    }

    let (Some(timestamp), Some(turbine_id), true) = (timestamp, turbine_id, violations.is_empty())
    else {
        return Err(violations);
    };

    let [voltage, vibration, wind_speed, power_output] = optional;
    let reading = TurbineReading {
        timestamp,
        turbine_id,
        site_id: record.text("site_id").unwrap_or(site_id).to_string(),
        temperature,
        humidity,
        pressure,
        voltage,
        vibration,
        wind_speed,
        power_output,
        pipeline_metadata: metadata,
    };

    check_bounds(&numeric_view(&reading), bounds)?;
    Ok(reading)
}

fn turbine_id(record: &SensorRecord) -> Option<String> {
    ["turbine_id", "location", "sensor_id"]
        .iter()
        .find_map(|f| record.text(f).ok().map(str::to_string))
        .or_else(|| match record.get("id") {
            Some(Value::Number(n)) => Some(format!("turbine_{n}")),
            Some(Value::String(s)) if !s.trim().is_empty() => Some(format!("turbine_{s}")),
            _ => None,
        })
}

/// The transformed numeric fields as a record, so the same bounds apply.
fn numeric_view(reading: &TurbineReading) -> SensorRecord {
    let mut view = SensorRecord::new()
        .with("temperature", reading.temperature)
        .with("humidity", reading.humidity)
        .with("pressure", reading.pressure);
    let optional = [
        reading.voltage,
        reading.vibration,
        reading.wind_speed,
        reading.power_output,
    ];
    for (field, value) in OPTIONAL_FIELDS.iter().zip(optional) {
        if let Some(v) = value {
            view.insert(*field, v);
        }
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationConfig;
    use crate::types::Phase;
    use chrono::{TimeZone, Utc};

    fn metadata() -> PipelineMetadata {
        PipelineMetadata {
            stage: Phase::Schematized,
            pipeline_version: "0.9.0".into(),
            processed_at: Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap(),
            node_id: "edge-1".into(),
            transformation_hash: "h".into(),
        }
    }

    fn sample() -> SensorRecord {
        SensorRecord::new()
            .with("id", 7)
            .with("timestamp", "2024-01-15T10:30:00Z")
            .with("temperature", 22.5)
            .with("humidity", 45.0)
    }

    fn transform(record: &SensorRecord) -> Result<TurbineReading, Vec<Violation>> {
        to_turbine(record, "site_a", &ValidationConfig::default().bounds, metadata())
    }

    #[test]
    fn test_defaults_applied() {
        let reading = transform(&sample()).unwrap();
        assert_eq!(reading.turbine_id, "turbine_7");
        assert_eq!(reading.site_id, "site_a");
        assert_eq!(reading.pressure, 1013.25);
        assert_eq!(reading.voltage, None);
        assert_eq!(reading.timestamp, Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_identifier_precedence() {
        let r = sample().with("sensor_id", "s-1").with("location", "turbine_001");
        assert_eq!(transform(&r).unwrap().turbine_id, "turbine_001");
        let r = sample().with("turbine_id", "T9").with("location", "turbine_001");
        assert_eq!(transform(&r).unwrap().turbine_id, "T9");
    }

    #[test]
    fn test_missing_identifier_fails_transform() {
        let mut map = sample().fields().clone();
        map.remove("id");
        let err = transform(&SensorRecord::from_map(map)).unwrap_err();
        assert!(matches!(err[0], Violation::TransformFailed { .. }));
    }

    #[test]
    fn test_bad_timestamp_fails() {
        let err = transform(&sample().with("timestamp", "soon")).unwrap_err();
        assert!(matches!(&err[0], Violation::WrongType { field, .. } if field == "timestamp"));
    }

    #[test]
    fn test_post_transform_range_check() {
        let err = transform(&sample().with("humidity", 150.0)).unwrap_err();
        assert!(matches!(&err[0], Violation::OutOfRange { field, .. } if field == "humidity"));

        let err = transform(&sample().with("vibration", 75.0)).unwrap_err();
        assert!(matches!(&err[0], Violation::OutOfRange { field, .. } if field == "vibration"));
    }

    #[test]
    fn test_optional_fields_carried() {
        let reading = transform(&sample().with("voltage", 12.1).with("wind_speed", 8.5)).unwrap();
        assert_eq!(reading.voltage, Some(12.1));
        assert_eq!(reading.wind_speed, Some(8.5));
    }
}
