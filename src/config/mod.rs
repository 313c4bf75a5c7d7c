//! Pipeline Configuration Module
//!
//! Loads the control-plane configuration from TOML: storage paths, retry
//! budget, validation bounds, anomaly rules, aggregation window and logical
//! sink names.
//!
//! ## Loading Order
//!
//! 1. `EDGE_PIPELINE_CONFIG` environment variable (path to TOML file)
//! 2. `pipeline.toml` in the current working directory
//! 3. Built-in defaults
//!
//! There is no process-wide config instance: the loaded `PipelineConfig` is
//! handed to `PipelineController::new` and flows from there.

mod pipeline_config;
pub mod defaults;
pub mod validation;

pub use pipeline_config::*;
