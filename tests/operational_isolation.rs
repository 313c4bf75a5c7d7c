//! Operational Source Isolation
//!
//! The sensor database is owned by the producer. These tests check that the
//! controller refuses to share storage with it and can never write to it.

use edge_pipeline::storage::{OperationalSource, SortOrder};
use edge_pipeline::{
    AccessMode, OperationalQuery, PipelineConfig, PipelineController, PipelineError,
};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn seed_sensor_db(dir: &Path) -> PathBuf {
    let path = dir.join("sensor_data.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE sensor_readings (
             id INTEGER PRIMARY KEY,
             timestamp TEXT NOT NULL,
             location TEXT,
             temperature REAL,
             humidity REAL,
             raw BLOB
         );
         INSERT INTO sensor_readings (timestamp, location, temperature, humidity, raw) VALUES
             ('2024-01-15T10:00:00Z', 'turbine_001', 21.5, 40.0, x'0aff'),
             ('2024-01-15T10:00:05Z', 'turbine_002', 22.0, 41.0, NULL),
             ('2024-01-15T10:00:10Z', 'turbine_001', 22.5, 42.0, NULL);",
    )
    .unwrap();
    path
}

fn config(dir: &Path, sensor_db: PathBuf) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.storage.config_db = dir.join("pipeline_config.db");
    config.storage.sensor_db = Some(sensor_db);
    config
}

fn row_count(path: &Path) -> i64 {
    Connection::open(path)
        .unwrap()
        .query_row("SELECT COUNT(*) FROM sensor_readings", [], |r| r.get(0))
        .unwrap()
}

// ============================================================================
// Startup isolation
// ============================================================================

#[test]
fn identical_paths_fail_at_startup() {
    let dir = TempDir::new().unwrap();
    let sensor = seed_sensor_db(dir.path());
    let mut cfg = config(dir.path(), sensor.clone());
    cfg.storage.config_db = sensor;
    let err = PipelineController::new(&cfg).unwrap_err();
    assert!(matches!(err, PipelineError::Configuration { .. }));
}

#[cfg(unix)]
#[test]
fn symlinked_config_store_fails_at_startup() {
    let dir = TempDir::new().unwrap();
    let sensor = seed_sensor_db(dir.path());
    let link = dir.path().join("looks_separate.db");
    std::os::unix::fs::symlink(&sensor, &link).unwrap();

    let mut cfg = config(dir.path(), sensor.clone());
    cfg.storage.config_db = link;
    let err = PipelineController::new(&cfg).unwrap_err();
    assert!(matches!(err, PipelineError::Configuration { .. }));
    assert_eq!(row_count(&sensor), 3);
}

#[test]
fn separate_paths_start_without_touching_sensor_db() {
    let dir = TempDir::new().unwrap();
    let sensor = seed_sensor_db(dir.path());
    let before = std::fs::read(&sensor).unwrap();

    let controller = PipelineController::new(&config(dir.path(), sensor.clone())).unwrap();
    controller.switch_phase("validated", "ops", "").unwrap();
    let _ = controller.recent_sensor_data(10).unwrap();

    assert_eq!(std::fs::read(&sensor).unwrap(), before);
}

// ============================================================================
// Read-only access
// ============================================================================

#[test]
fn write_access_is_refused() {
    let dir = TempDir::new().unwrap();
    let sensor = seed_sensor_db(dir.path());
    let err = OperationalSource::open(&sensor, AccessMode::ReadWrite).unwrap_err();
    assert!(matches!(err, PipelineError::IsolationViolation { .. }));
    assert_eq!(err.kind(), "isolation_violation");
}

#[test]
fn no_write_statement_gets_through() {
    let dir = TempDir::new().unwrap();
    let sensor = seed_sensor_db(dir.path());
    let controller = PipelineController::new(&config(dir.path(), sensor.clone())).unwrap();

    let attempts = [
        "DELETE FROM sensor_readings",
        "UPDATE sensor_readings SET temperature = 0",
        "INSERT INTO sensor_readings (timestamp) VALUES ('x')",
        "DROP TABLE sensor_readings",
        "SELECT 1; DELETE FROM sensor_readings",
        "WITH x AS (SELECT 1) DELETE FROM sensor_readings",
        "PRAGMA journal_mode = DELETE",
        "ATTACH DATABASE 'other.db' AS other",
    ];
    for sql in attempts {
        let err = controller
            .read_operational_data(&OperationalQuery::sql(sql))
            .unwrap_err();
        assert!(
            matches!(err, PipelineError::IsolationViolation { .. } | PipelineError::Storage { .. }),
            "{sql}: {err}"
        );
    }
    assert_eq!(row_count(&sensor), 3);
}

#[test]
fn structured_queries_read_rows() {
    let dir = TempDir::new().unwrap();
    let sensor = seed_sensor_db(dir.path());
    let controller = PipelineController::new(&config(dir.path(), sensor)).unwrap();

    let query = OperationalQuery::table("sensor_readings")
        .filter_eq("location", "turbine_001")
        .order_by("id", SortOrder::Desc)
        .limit(1);
    let rows = controller.read_operational_data(&query.into()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].number("temperature").unwrap(), 22.5);

    let rows = controller
        .read_operational_data(&OperationalQuery::sql(
            "SELECT raw FROM sensor_readings WHERE raw IS NOT NULL",
        ))
        .unwrap();
    assert_eq!(rows[0].text("raw").unwrap(), "0aff");
}

#[test]
fn injected_identifiers_are_rejected() {
    let dir = TempDir::new().unwrap();
    let sensor = seed_sensor_db(dir.path());
    let controller = PipelineController::new(&config(dir.path(), sensor.clone())).unwrap();

    let query = OperationalQuery::table("sensor_readings; DROP TABLE sensor_readings").limit(1);
    let err = controller.read_operational_data(&query.into()).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidArgument { .. }));

    let err = controller.table_info("missing_table").unwrap_err();
    assert!(matches!(err, PipelineError::InvalidArgument { .. }));
    assert_eq!(row_count(&sensor), 3);
}

#[test]
fn table_listing_and_schema() {
    let dir = TempDir::new().unwrap();
    let sensor = seed_sensor_db(dir.path());
    let controller = PipelineController::new(&config(dir.path(), sensor)).unwrap();

    assert!(controller.verify_connection());
    assert_eq!(controller.list_tables().unwrap(), vec!["sensor_readings"]);

    let info = controller.table_info("sensor_readings").unwrap();
    assert_eq!(info.row_count, 3);
    let id = info.columns.iter().find(|c| c.name == "id").unwrap();
    assert!(id.primary_key);
    let ts = info.columns.iter().find(|c| c.name == "timestamp").unwrap();
    assert!(ts.not_null);
    assert_eq!(ts.data_type, "TEXT");
}

#[test]
fn sensor_db_may_appear_after_startup() {
    let dir = TempDir::new().unwrap();
    let sensor = dir.path().join("sensor_data.db");
    let controller = PipelineController::new(&config(dir.path(), sensor)).unwrap();

    assert!(!controller.verify_connection());
    assert!(matches!(
        controller.list_tables().unwrap_err(),
        PipelineError::Storage { .. }
    ));

    seed_sensor_db(dir.path());
    assert!(controller.verify_connection());
}
