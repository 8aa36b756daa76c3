//! # Error Policy
//!
//! Requeue decisions for failed reconciliations. Each resource backs off on its own
//! Fibonacci sequence, reset by the next clean reconcile.

use crate::constants;
use crate::controller::reconciler::{resource_key, BackoffState, Reconciler, ReconcilerError};
use crate::observability;
use crate::store::ObjectKey;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Handle a reconciliation error for any resource kind
pub fn handle_reconciliation_error<K>(
    obj: Arc<K>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler>,
) -> Action
where
    K: kube::Resource<DynamicType = ()>,
{
    let kind = K::kind(&());
    let key = ObjectKey::for_resource(obj.as_ref());

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.kind = %kind,
        resource.name = %key.name,
        resource.namespace = %key.namespace,
        error = %error
    );
    let _error_guard = error_span.enter();

    error!("Reconciliation error for {} {}: {}", kind, key, error);
    observability::metrics::increment_reconciliation_errors(&kind);

    let (backoff_seconds, error_count) = match ctx.backoff_states.lock() {
        Ok(mut states) => {
            let state = states
                .entry(resource_key(&kind, &key))
                .or_insert_with(BackoffState::new);
            state.increment_error();
            (state.backoff.next_backoff_seconds(), state.error_count)
        }
        Err(e) => {
            warn!(
                "Failed to lock backoff_states: {}, using default backoff",
                e
            );
            (constants::DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS, 0)
        }
    };

    info!(
        "🔄 Retrying {} {} in {}s (error count: {})",
        kind, key, backoff_seconds, error_count
    );
    observability::metrics::increment_requeues_total("error-backoff");
    Action::requeue(Duration::from_secs(backoff_seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::controller::reconciler::{CloneReconciler, ProfileReconciler};
    use crate::crd::{DataClone, DataCloneSpec};
    use crate::database::{MemoryConnector, MemoryDatabase};
    use crate::provider::MemoryStorageProvider;
    use crate::store::MemoryStore;

    fn reconciler() -> Arc<Reconciler> {
        let store = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryStorageProvider::new());
        let config = ControllerConfig::default();
        let clones = CloneReconciler::new(
            store.clone(),
            storage.clone(),
            Arc::new(MemoryConnector::new(Arc::new(MemoryDatabase::new()))),
            config.clone(),
        );
        let profiles = ProfileReconciler::new(store, storage, config.clone());
        Arc::new(Reconciler::new(clones, profiles, config))
    }

    fn pr_123() -> Arc<DataClone> {
        let mut clone = DataClone::new(
            "pr-123",
            DataCloneSpec {
                source_profile: "nightly".to_string(),
                snapshot_name: None,
                ttl: None,
                database: None,
                pod: None,
                storage: None,
                masking: None,
            },
        );
        clone.metadata.namespace = Some("default".to_string());
        Arc::new(clone)
    }

    fn requeue_secs(secs: u64) -> Action {
        Action::requeue(Duration::from_secs(secs))
    }

    #[test]
    fn test_backoff_grows_and_restarts_after_a_clean_reconcile() {
        let ctx = reconciler();
        let clone = pr_123();
        let key = ObjectKey::for_resource(clone.as_ref());
        let error = ReconcilerError::MissingProfile(key.sibling("nightly"));
        let min = constants::DEFAULT_BACKOFF_MIN_SECS;

        let actions: Vec<Action> = (0..3)
            .map(|_| handle_reconciliation_error(clone.clone(), &error, ctx.clone()))
            .collect();
        assert_eq!(
            actions,
            vec![requeue_secs(min), requeue_secs(min), requeue_secs(2 * min)]
        );

        ctx.reset_backoff(&resource_key("DataClone", &key));
        assert_eq!(
            handle_reconciliation_error(clone, &error, ctx),
            requeue_secs(min)
        );
    }
}
