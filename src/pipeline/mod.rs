//! Pipeline control plane
//!
//! ```text
//! operator CLI / uploader
//!        │
//!        ▼
//! PipelineController ──► ConfigStore (read-write, config db)
//!        │           ──► OperationalSource (read-only, sensor db)
//!        ▼
//!   PhaseRouter ──► RoutingResult { valid → sink A, invalid → sink B }
//! ```
//!
//! The controller returns routing results; shipping them to the sinks is the
//! caller's job.

mod controller;

pub use controller::{PipelineController, PruneReport};
