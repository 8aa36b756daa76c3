//! # HTTP Server Tests
//!
//! Serve the probe and metrics router on a local port and query it over HTTP.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vandal_controller::controller::server::{start_server, ServerState};
use vandal_controller::observability;

const PORT: u16 = 39187;

async fn wait_until_ready(state: &ServerState) {
    for _ in 0..100 {
        if state.is_ready.load(Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server did not become ready");
}

#[tokio::test]
async fn test_probes_and_metrics_are_served() {
    observability::metrics::register_metrics().expect("metrics register once");
    observability::metrics::increment_snapshots_created();

    let state = Arc::new(ServerState::default());
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(start_server(PORT, Arc::clone(&state), shutdown.clone()));
    wait_until_ready(&state).await;

    let base = format!("http://127.0.0.1:{PORT}");
    let client = reqwest::Client::new();

    let health = client
        .get(format!("{base}/healthz"))
        .send()
        .await
        .expect("healthz responds");
    assert_eq!(health.status(), reqwest::StatusCode::OK);
    assert_eq!(health.text().await.expect("body"), "ok");

    let ready = client
        .get(format!("{base}/readyz"))
        .send()
        .await
        .expect("readyz responds");
    assert_eq!(ready.status(), reqwest::StatusCode::OK);

    let metrics = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .expect("metrics respond")
        .text()
        .await
        .expect("body");
    assert!(metrics.contains("vandal_snapshots_created_total"));

    state.is_ready.store(false, Ordering::Relaxed);
    let not_ready = client
        .get(format!("{base}/readyz"))
        .send()
        .await
        .expect("readyz responds");
    assert_eq!(not_ready.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

    shutdown.cancel();
    server
        .await
        .expect("server task joins")
        .expect("server shuts down cleanly");
}
