//! edge-pipeline: phase configuration and data routing for edge sensor uploads
//!
//! A small control plane that decides how a batch of sensor records is
//! processed and where it goes.
//!
//! ## Architecture
//!
//! - **ConfigStore**: durable current phase, phase history and execution
//!   records in a dedicated SQLite file
//! - **PhaseRouter**: pure mapping from (phase, batch) to a routing result
//! - **PipelineController**: the only writer of phase state; keeps the
//!   operational sensor database strictly read-only
//!
//! ```no_run
//! use edge_pipeline::{PipelineConfig, PipelineController, SensorRecord};
//!
//! # fn main() -> edge_pipeline::Result<()> {
//! let controller = PipelineController::new(&PipelineConfig::load())?;
//! controller.switch_phase("validated", "alice", "demo")?;
//!
//! let batch = vec![SensorRecord::new().with("temperature", 21.5).with("humidity", 40.0)];
//! let routed = controller.process_batch(&batch)?;
//! println!("{} valid -> {}", routed.valid_records.len(), routed.destinations.valid);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod routing;
pub mod storage;
pub mod types;

pub use config::PipelineConfig;
pub use error::{ErrorContext, PipelineError, Result};
pub use pipeline::{PipelineController, PruneReport};
pub use routing::{Destinations, PhaseRouter, Processing, RoutingMode, RoutingResult};
pub use storage::{AccessMode, ConfigStore, OperationalQuery, RetryPolicy, TableQuery};
pub use types::{
    ExecutionOutcome, ExecutionRecord, OutputRecord, Phase, PhaseConfig, RejectedRecord,
    SensorRecord, Violation,
};
