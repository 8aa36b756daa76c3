//! # Vandal Controller
//!
//! Kubernetes controller that keeps scheduled snapshots of database volumes and turns
//! them into short-lived, masked database clones.
//!
//! Two custom resources drive it:
//!
//! 1. **DataProfile** - a cron schedule and retention policy for one source volume
//! 2. **DataClone** - an ephemeral database restored from a profile snapshot, masked
//!    before it is handed out, and removed again when its TTL elapses
//!
//! The reconcilers talk to the cluster through the [`store::ObjectStore`],
//! [`provider::StorageProvider`] and [`database::DatabaseConnector`] seams so the
//! lifecycle logic runs unchanged against the in-memory implementations used in tests.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod database;
pub mod masking;
pub mod observability;
pub mod provider;
pub mod runtime;
pub mod store;

pub use crd::*;
