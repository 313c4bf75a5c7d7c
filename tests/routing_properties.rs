//! Routing Properties
//!
//! Completeness, ordering and metadata rules of `PhaseRouter` across every
//! phase, with a mixed batch of clean, out-of-range and malformed records.

use edge_pipeline::routing::{PhaseDefinition, PhaseTable, RoutingRules};
use edge_pipeline::{
    OutputRecord, Phase, PhaseRouter, PipelineConfig, PipelineError, Processing, RoutingMode,
    SensorRecord, Violation,
};

fn router() -> PhaseRouter {
    PhaseRouter::from_config(&PipelineConfig::default())
}

fn mixed_batch() -> Vec<SensorRecord> {
    let base = |id: i64, minute: u32| {
        SensorRecord::new()
            .with("id", id)
            .with("timestamp", format!("2024-01-15T10:{minute:02}:10Z"))
            .with("location", if id % 2 == 0 { "turbine_002" } else { "turbine_001" })
            .with("temperature", 20.0 + id as f64)
            .with("humidity", 45.0)
            .with("voltage", 12.0)
    };
    vec![
        base(1, 0),
        base(2, 0),
        base(3, 1).with("humidity", 150.0),
        base(4, 1).with("temperature", "warm"),
        SensorRecord::new().with("id", 5),
        base(6, 2).with("vibration", 30.0),
        base(7, 2).with("pressure", 400.0),
        base(8, 3).with("timestamp", 1_705_314_600),
    ]
}

#[test]
fn every_input_is_classified_exactly_once() {
    let router = router();
    let batch = mixed_batch();
    for phase in Phase::ALL {
        let result = router.route(phase, &batch).unwrap();
        assert_eq!(result.classified(), batch.len(), "{phase}");
        if !result.destinations.to_vec().contains(&"anomaly-sink".to_string()) {
            assert!(result.invalid_records.is_empty(), "{phase}");
        }
        if result.applied_transform != Processing::Aggregate {
            assert_eq!(result.valid_records.len(), result.valid_inputs, "{phase}");
        }
    }
}

#[test]
fn direct_routing_keeps_everything() {
    let batch = mixed_batch();
    let result = router().route(Phase::Raw, &batch).unwrap();
    let passed: Vec<SensorRecord> = result
        .valid_records
        .into_iter()
        .map(|r| match r {
            OutputRecord::Raw(rec) => rec,
            other => panic!("raw phase must not transform: {other:?}"),
        })
        .collect();
    assert_eq!(passed, batch);
    assert!(result.invalid_records.is_empty());
    assert_eq!(result.destinations.invalid, None);
}

#[test]
fn partitions_preserve_batch_order() {
    let batch = mixed_batch();
    let result = router().route(Phase::Validated, &batch).unwrap();

    let valid_ids: Vec<i64> = result
        .valid_records
        .iter()
        .filter_map(|r| r.source_record())
        .filter_map(|r| r.get("id").and_then(|v| v.as_i64()))
        .collect();
    let invalid_ids: Vec<i64> = result
        .invalid_records
        .iter()
        .filter_map(|r| r.record.get("id").and_then(|v| v.as_i64()))
        .collect();

    assert_eq!(valid_ids, vec![1, 2, 6, 8]);
    assert_eq!(invalid_ids, vec![3, 4, 5, 7]);
}

#[test]
fn malformed_records_carry_explicit_violations() {
    let batch = mixed_batch();
    let result = router().route(Phase::Validated, &batch).unwrap();
    let missing = result
        .invalid_records
        .iter()
        .find(|r| r.record.get("id").and_then(|v| v.as_i64()) == Some(5))
        .unwrap();
    assert!(missing
        .violations
        .iter()
        .all(|v| matches!(v, Violation::MissingField { .. })));
    assert_eq!(missing.violations.len(), 2);
}

#[test]
fn only_transforming_phases_annotate_output() {
    let router = router();
    let batch = mixed_batch();
    for phase in Phase::ALL {
        let result = router.route(phase, &batch).unwrap();
        let annotated = result.valid_records.iter().all(|r| r.metadata().is_some());
        let plain = result.valid_records.iter().all(|r| r.metadata().is_none());
        match phase {
            Phase::Raw | Phase::Anomaly => assert!(plain, "{phase}"),
            _ => assert!(annotated, "{phase}"),
        }
        for meta in result.valid_records.iter().filter_map(|r| r.metadata()) {
            assert_eq!(meta.stage, phase);
            assert_eq!(meta.node_id, "edge-node");
            assert_eq!(Some(meta.transformation_hash.as_str()), router.transformation_hash(phase));
        }
    }
}

#[test]
fn aggregation_only_uses_valid_inputs() {
    let batch = mixed_batch();
    let result = router().route(Phase::Aggregated, &batch).unwrap();
    assert_eq!(result.valid_inputs, 4);

    let total: usize = result
        .valid_records
        .iter()
        .map(|r| match r {
            OutputRecord::Aggregate(a) => a.sample_count,
            other => panic!("expected aggregate, got {other:?}"),
        })
        .sum();
    assert_eq!(total, result.valid_inputs);
}

#[test]
fn sinks_follow_configuration() {
    let mut config = PipelineConfig::default();
    config.sinks.validated = "s3://edge/validated".into();
    config.sinks.anomaly = "s3://edge/quarantine".into();
    let router = PhaseRouter::new(
        PhaseTable::standard(&config.sinks),
        RoutingRules::from_config(&config),
    );
    let result = router.route(Phase::Validated, &[]).unwrap();
    assert_eq!(result.destinations.valid, "s3://edge/validated");
    assert_eq!(result.destinations.invalid.as_deref(), Some("s3://edge/quarantine"));
}

#[test]
fn direct_routing_never_leaves_records_without_a_sink() {
    let direct = |processing| PhaseDefinition {
        phase: Phase::Validated,
        processing,
        routing: RoutingMode::Direct {
            sink: "only-sink".into(),
        },
    };

    let err = PhaseTable::from_definitions([direct(Processing::BasicValidate)]).unwrap_err();
    assert!(matches!(err, PipelineError::Configuration { .. }));

    let table = PhaseTable::from_definitions([direct(Processing::None)]).unwrap();
    let router = PhaseRouter::new(table, RoutingRules::default());
    let batch = mixed_batch();
    let result = router.route(Phase::Validated, &batch).unwrap();
    assert!(result.invalid_records.is_empty());
    assert_eq!(result.valid_inputs, batch.len());
    assert_eq!(result.destinations.to_vec(), vec!["only-sink"]);
}

#[test]
fn aggregation_survives_timestamps_at_the_calendar_limit() {
    let mut batch = mixed_batch();
    batch.push(
        SensorRecord::new()
            .with("id", 9)
            .with("timestamp", 8_210_266_876_799_i64)
            .with("location", "turbine_001")
            .with("temperature", 21.0)
            .with("humidity", 45.0),
    );
    let result = router().route(Phase::Aggregated, &batch).unwrap();
    assert_eq!(result.classified(), batch.len());
    assert_eq!(result.valid_inputs, 4);

    let last = result.invalid_records.last().unwrap();
    assert_eq!(last.record.get("id").and_then(|v| v.as_i64()), Some(9));
    assert!(matches!(last.violations.as_slice(), [Violation::TransformFailed { .. }]));
}
