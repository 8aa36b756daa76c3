//! # Initialization
//!
//! Controller startup: rustls provider, tracing, metrics, the HTTP server and the
//! Kubernetes-backed reconciler context.

use crate::config::{load_config, ControllerConfig, ServerConfig};
use crate::controller::reconciler::{CloneReconciler, ProfileReconciler, Reconciler};
use crate::controller::server::{start_server, ServerState};
use crate::database::EngineConnector;
use crate::observability;
use crate::provider::storage_provider_for;
use crate::store::{KubeStore, ObjectStore};
use anyhow::{Context, Result};
use kube::Client;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Everything the watch loop needs
pub struct InitializationResult {
    pub client: Client,
    pub reconciler: Arc<Reconciler>,
    pub server_state: Arc<ServerState>,
    pub server_handle: JoinHandle<()>,
    /// Cancelled on shutdown; stops the HTTP server and in-flight masking runs
    pub shutdown: CancellationToken,
}

/// Install the ring crypto provider for rustls.
///
/// Must run before any TLS connection is made. A provider installed earlier by
/// someone else is fine.
pub fn install_crypto_provider() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider was already installed");
    }
}

/// Set up the fmt subscriber, honouring `RUST_LOG`
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .try_init();
}

/// Initialize the controller runtime
pub async fn initialize() -> Result<InitializationResult> {
    install_crypto_provider();
    init_tracing("vandal_controller=info");

    info!("Starting Vandal controller v{}", env!("CARGO_PKG_VERSION"));
    let (controller_config, server_config) = load_config();
    info!("Configuration: {:?}", controller_config);

    observability::metrics::register_metrics()?;

    let shutdown = CancellationToken::new();
    let server_state = Arc::new(ServerState::default());
    let server_handle = {
        let state = Arc::clone(&server_state);
        let token = shutdown.clone();
        let port = server_config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = start_server(port, state, token).await {
                error!("HTTP server error: {:#}", e);
            }
        })
    };
    wait_for_server_ready(&server_config, &server_state, &server_handle).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let reconciler = Arc::new(build_reconciler(
        client.clone(),
        controller_config,
        shutdown.clone(),
    ));

    info!("Controller initialized, starting watch loops...");
    Ok(InitializationResult {
        client,
        reconciler,
        server_state,
        server_handle,
        shutdown,
    })
}

/// Reconciler context backed by the cluster
pub fn build_reconciler(
    client: Client,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> Reconciler {
    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone()));
    let storage = storage_provider_for(&config, client);
    let clones = CloneReconciler::new(
        Arc::clone(&store),
        Arc::clone(&storage),
        Arc::new(EngineConnector::new(config.masking_max_concurrent_tables)),
        config.clone(),
    )
    .with_shutdown(shutdown);
    let profiles = ProfileReconciler::new(store, storage, config.clone());
    Reconciler::new(clones, profiles, config)
}

/// Wait for the HTTP server to bind, failing if it dies or takes too long
async fn wait_for_server_ready(
    config: &ServerConfig,
    server_state: &ServerState,
    server_handle: &JoinHandle<()>,
) -> Result<()> {
    let startup_timeout = Duration::from_secs(config.startup_timeout_secs);
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let start_time = Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }
        if server_state.is_ready.load(Ordering::Relaxed) {
            info!("HTTP server is ready");
            return Ok(());
        }
        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server did not become ready within {}s",
                config.startup_timeout_secs
            ));
        }
        tokio::time::sleep(poll_interval).await;
    }
}
