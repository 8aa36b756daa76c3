//! # Controller
//!
//! Reconcilers for DataProfile and DataClone plus the pieces the runtime wires around
//! them: per-resource retry backoff and the metrics/probe HTTP server.

pub mod backoff;
pub mod reconciler;
pub mod server;
