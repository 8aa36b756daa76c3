//! # Reconciler
//!
//! Entry points invoked by the kube-runtime controllers. Each adapter resolves the
//! resource key, runs the matching reconciler inside a span and converts the outcome
//! into an [`Action`].
//!
//! - [`clone`] - DataClone lifecycle state machine
//! - [`profile`] - DataProfile snapshot schedule and retention
//! - [`status`] - conflict-retrying status and finalizer writes
//! - [`validation`] - TTL and cron parsing

pub mod clone;
pub mod profile;
pub mod status;
pub mod types;
pub mod validation;

pub use clone::CloneReconciler;
pub use profile::ProfileReconciler;
pub use types::*;

use crate::crd::{DataClone, DataProfile};
use crate::observability;
use crate::store::ObjectKey;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info_span, Instrument};

/// Key used for per-resource backoff bookkeeping
pub fn resource_key(kind: &str, key: &ObjectKey) -> String {
    format!("{kind}/{key}")
}

pub async fn reconcile_clone(
    clone: Arc<DataClone>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let key = ObjectKey::for_resource(clone.as_ref());
    let span = info_span!("reconcile", kind = "DataClone", resource = %key);
    observability::metrics::increment_reconciliations("DataClone");
    let started = Instant::now();

    let result = ctx
        .clones
        .reconcile(&key, chrono::Utc::now())
        .instrument(span)
        .await;
    observability::metrics::observe_reconciliation_duration(
        "DataClone",
        started.elapsed().as_secs_f64(),
    );

    let outcome = result?;
    ctx.reset_backoff(&resource_key("DataClone", &key));
    if outcome.requeue_after.is_some() {
        observability::metrics::increment_requeues_total("clone-progress");
    }
    Ok(outcome.into_action())
}

pub async fn reconcile_profile(
    profile: Arc<DataProfile>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let key = ObjectKey::for_resource(profile.as_ref());
    let span = info_span!("reconcile", kind = "DataProfile", resource = %key);
    observability::metrics::increment_reconciliations("DataProfile");
    let started = Instant::now();

    let result = ctx
        .profiles
        .reconcile(&key, chrono::Utc::now())
        .instrument(span)
        .await;
    observability::metrics::observe_reconciliation_duration(
        "DataProfile",
        started.elapsed().as_secs_f64(),
    );

    let outcome = result?;
    ctx.reset_backoff(&resource_key("DataProfile", &key));
    if outcome.requeue_after.is_some() {
        observability::metrics::increment_requeues_total("profile-resync");
    }
    Ok(outcome.into_action())
}
