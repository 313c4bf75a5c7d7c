//! Tumbling-window aggregation
//!
//! Key = (group field value, window). A window starts at the record timestamp
//! floored to a multiple of `window_secs` since the unix epoch.
//! Output order follows the first appearance of each key in the batch.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use serde_json::Value;
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, HashMap};

use crate::config::{defaults, AggregationConfig};
use crate::types::{AggregateReading, FieldStats, PipelineMetadata, SensorRecord};

/// Half-open `[start, end)` aggregation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// Window of `window_secs` containing `ts`. `None` for a zero length or
    /// when either edge falls outside the range chrono can represent.
    pub fn containing(ts: DateTime<Utc>, window_secs: u64) -> Option<Self> {
        let secs = i64::try_from(window_secs).ok().filter(|s| *s > 0)?;
        let length = TimeDelta::try_seconds(secs)?;
        let floor = ts.timestamp().div_euclid(secs).checked_mul(secs)?;
        let start = Utc.timestamp_opt(floor, 0).single()?;
        let end = start.checked_add_signed(length)?;
        Some(Self { start, end })
    }
}

/// Group label for `record`; text and numbers are accepted.
pub fn group_of(record: &SensorRecord, group_field: &str) -> String {
    match record.get(group_field) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => defaults::AGGREGATION_UNGROUPED.to_string(),
    }
}

/// Summarize already-validated records, one `AggregateReading` per key.
pub fn aggregate(
    records: &[(&SensorRecord, Window)],
    config: &AggregationConfig,
    metadata: &PipelineMetadata,
) -> Vec<AggregateReading> {
    let mut order: Vec<(String, Window)> = Vec::new();
    let mut buckets: HashMap<(String, Window), Vec<&SensorRecord>> = HashMap::new();

    for &(record, window) in records {
        let key = (group_of(record, &config.group_field), window);
        buckets
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(record);
    }

    order
        .into_iter()
        .filter_map(|key| {
            let members = buckets.remove(&key)?;
            let (group, window) = key;
            Some(AggregateReading {
                group,
                window_start: window.start,
                window_end: window.end,
                sample_count: members.len(),
                fields: summarize(&members, &config.fields),
                pipeline_metadata: metadata.clone(),
            })
        })
        .collect()
}

fn summarize(members: &[&SensorRecord], fields: &[String]) -> BTreeMap<String, FieldStats> {
    fields
        .iter()
        .filter_map(|field| {
            let values: Vec<f64> = members
                .iter()
                .filter_map(|r| r.optional_number(field).ok().flatten())
                .collect();
            field_stats(&values).map(|stats| (field.clone(), stats))
        })
        .collect()
}

/// Count, mean, min, max and sample standard deviation. `None` when empty.
pub fn field_stats(values: &[f64]) -> Option<FieldStats> {
    if values.is_empty() {
        return None;
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(FieldStats {
        count: values.len(),
        mean: Statistics::mean(values.iter()),
        min,
        max,
        std_dev: (values.len() > 1).then(|| Statistics::std_dev(values.iter())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Phase;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    fn metadata() -> PipelineMetadata {
        PipelineMetadata {
            stage: Phase::Aggregated,
            pipeline_version: "0.9.0".into(),
            processed_at: ts(12, 0, 0),
            node_id: "edge-1".into(),
            transformation_hash: "h".into(),
        }
    }

    fn record(location: &str, temperature: f64) -> SensorRecord {
        SensorRecord::new()
            .with("location", location)
            .with("temperature", temperature)
    }

    fn minute(t: DateTime<Utc>) -> Window {
        Window::containing(t, AggregationConfig::default().window_secs).unwrap()
    }

    #[test]
    fn test_window_floors_to_multiple() {
        let w = Window::containing(ts(10, 0, 59), 60).unwrap();
        assert_eq!((w.start, w.end), (ts(10, 0, 0), ts(10, 1, 0)));
        assert_eq!(Window::containing(ts(10, 1, 0), 60).unwrap().start, ts(10, 1, 0));
        assert_eq!(Window::containing(ts(10, 7, 30), 300).unwrap().start, ts(10, 5, 0));
    }

    #[test]
    fn test_window_out_of_range_is_none() {
        assert_eq!(Window::containing(DateTime::<Utc>::MAX_UTC, 60), None);
        let last = Utc.timestamp_opt(8_210_266_876_799, 0).unwrap();
        assert_eq!(Window::containing(last, 60), None);
        assert_eq!(Window::containing(ts(10, 0, 0), 0), None);
        assert_eq!(Window::containing(ts(10, 0, 0), 10_000_000_000_000_000), None);
        assert_eq!(Window::containing(ts(10, 0, 0), u64::MAX), None);
    }

    #[test]
    fn test_groups_and_windows_in_first_appearance_order() {
        let a1 = record("north", 20.0);
        let b1 = record("south", 30.0);
        let a2 = record("north", 22.0);
        let a3 = record("north", 40.0);
        let input = vec![
            (&a1, minute(ts(10, 0, 5))),
            (&b1, minute(ts(10, 0, 10))),
            (&a2, minute(ts(10, 0, 50))),
            (&a3, minute(ts(10, 1, 5))),
        ];
        let out = aggregate(&input, &AggregationConfig::default(), &metadata());

        assert_eq!(out.len(), 3);
        assert_eq!((out[0].group.as_str(), out[0].window_start), ("north", ts(10, 0, 0)));
        assert_eq!((out[1].group.as_str(), out[1].window_start), ("south", ts(10, 0, 0)));
        assert_eq!((out[2].group.as_str(), out[2].window_start), ("north", ts(10, 1, 0)));

        assert_eq!(out[0].sample_count, 2);
        assert_eq!(out[0].window_end, ts(10, 1, 0));
        let t = &out[0].fields["temperature"];
        assert_eq!(t.count, 2);
        assert!((t.mean - 21.0).abs() < 1e-9);
        assert_eq!((t.min, t.max), (20.0, 22.0));
        assert!((t.std_dev.unwrap() - 2f64.sqrt()).abs() < 1e-9);

        assert_eq!(out[1].fields["temperature"].std_dev, None);
        assert!(!out[0].fields.contains_key("humidity"));
    }

    #[test]
    fn test_missing_group_uses_unassigned() {
        let r = SensorRecord::new().with("temperature", 1.0);
        let out = aggregate(&[(&r, minute(ts(10, 0, 0)))], &AggregationConfig::default(), &metadata());
        assert_eq!(out[0].group, "unassigned");
    }

    #[test]
    fn test_empty_input() {
        assert!(aggregate(&[], &AggregationConfig::default(), &metadata()).is_empty());
        assert!(field_stats(&[]).is_none());
    }
}
