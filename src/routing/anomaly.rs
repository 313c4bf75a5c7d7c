//! Rule-based anomaly classifier
//!
//! A record is flagged when any rule's field falls outside its expected band.
//! Required fields that are missing or non-numeric flag the record too, so a
//! malformed reading lands in the anomaly sink instead of being dropped.

use super::validate::read_field;
use crate::config::FieldBound;
use crate::types::{SensorRecord, Violation};

/// Reasons `record` is anomalous. Empty means normal.
pub fn classify(record: &SensorRecord, rules: &[FieldBound]) -> Vec<Violation> {
    rules
        .iter()
        .filter_map(|rule| match read_field(record, rule) {
            Ok(Some(value)) if !rule.contains(value) => Some(Violation::Anomalous {
                field: rule.field.clone(),
                value,
                min: rule.min,
                max: rule.max,
            }),
            Ok(_) => None,
            Err(e) => Some(e.into()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnomalyConfig;

    fn rules() -> Vec<FieldBound> {
        AnomalyConfig::default().rules
    }

    #[test]
    fn test_normal_reading() {
        let r = SensorRecord::new()
            .with("temperature", 22.0)
            .with("humidity", 50.0)
            .with("voltage", 12.0);
        assert!(classify(&r, &rules()).is_empty());
    }

    #[test]
    fn test_flags_each_band() {
        let r = SensorRecord::new()
            .with("temperature", 55.0)
            .with("vibration", 12.0)
            .with("voltage", 9.8);
        let flags = classify(&r, &rules());
        let fields: Vec<_> = flags
            .iter()
            .map(|v| match v {
                Violation::Anomalous { field, .. } => field.as_str(),
                _ => "other",
            })
            .collect();
        assert_eq!(fields, vec!["temperature", "vibration", "voltage"]);
    }

    #[test]
    fn test_missing_required_field_is_flagged() {
        let r = SensorRecord::new().with("humidity", 50.0);
        assert_eq!(
            classify(&r, &rules()),
            vec![Violation::MissingField {
                field: "temperature".into()
            }]
        );
    }

    #[test]
    fn test_band_edges_are_normal() {
        let r = SensorRecord::new()
            .with("temperature", -10.0)
            .with("humidity", 95.0)
            .with("voltage", 13.5);
        assert!(classify(&r, &rules()).is_empty());
    }
}
