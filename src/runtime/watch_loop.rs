//! # Watch Loop
//!
//! Runs the DataProfile and DataClone controllers side by side until a shutdown
//! signal arrives.

use super::error_policy::handle_reconciliation_error;
use crate::controller::reconciler::{reconcile_clone, reconcile_profile, Reconciler};
use crate::controller::server::ServerState;
use crate::crd::{DataClone, DataProfile};
use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use kube_runtime::{watcher, Controller};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Resolve once SIGINT or SIGTERM is received
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// Run both controllers until shutdown, then cancel `shutdown` for everyone else
pub async fn run_watch_loop(
    client: Client,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let profiles: Api<DataProfile> = Api::all(client.clone());
    let clones: Api<DataClone> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);

    let signal = {
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                () = shutdown_signal() => info!("Shutdown signal received"),
                () = shutdown.cancelled() => {},
            }
        }
    };
    let signal = futures::future::FutureExt::shared(signal);

    let profile_controller = Controller::new(profiles, watcher::Config::default())
        .graceful_shutdown_on(signal.clone())
        .run(
            reconcile_profile,
            handle_reconciliation_error::<DataProfile>,
            Arc::clone(&reconciler),
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => tracing::debug!("Reconciled DataProfile {}", obj.name),
                Err(e) => warn!("DataProfile controller stream error: {}", e),
            }
        });

    // Pod readiness changes wake the owning clone while it waits in MaskingInProgress
    let clone_controller = Controller::new(clones, watcher::Config::default())
        .owns(pods, watcher::Config::default())
        .graceful_shutdown_on(signal)
        .run(
            reconcile_clone,
            handle_reconciliation_error::<DataClone>,
            Arc::clone(&reconciler),
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => tracing::debug!("Reconciled DataClone {}", obj.name),
                Err(e) => warn!("DataClone controller stream error: {}", e),
            }
        });

    info!("Watching DataProfile and DataClone resources in all namespaces");
    futures::join!(profile_controller, clone_controller);

    info!("Controllers stopped, shutting down");
    server_state.is_ready.store(false, Ordering::Relaxed);
    shutdown.cancel();
    Ok(())
}
