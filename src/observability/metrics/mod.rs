//! # Metrics Module
//!
//! Prometheus metrics for monitoring the controller, organized by responsibility.
//!
//! ## Sub-modules
//!
//! - `registry` - Metrics registry setup, registration and text exposition
//! - `controller_metrics` - Reconciliations, requeues and clone lifecycle
//! - `processing_metrics` - Snapshots, retention, schedules and masking

pub mod controller_metrics;
pub mod processing_metrics;
pub mod registry;

pub use controller_metrics::*;
pub use processing_metrics::*;
pub use registry::*;
