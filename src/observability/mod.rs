//! # Observability
//!
//! Prometheus metrics for the controllers and the masking pipeline.

pub mod metrics;
