//! # Vandal Controller
//!
//! Runs the DataProfile and DataClone controllers plus the metrics/probe server.
//!
//! ## Overview
//!
//! 1. **DataProfile** - snapshots a database volume on a cron schedule and prunes
//!    snapshots beyond the retention count
//! 2. **DataClone** - restores a snapshot into a fresh database, masks it and hands out
//!    credentials until its TTL runs out
//!
//! Configuration comes from environment variables, see [`vandal_controller::config`].

use anyhow::Result;
use vandal_controller::runtime::{initialize, run_watch_loop};

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;

    run_watch_loop(
        init.client,
        init.reconciler,
        init.server_state,
        init.shutdown.clone(),
    )
    .await?;

    // The server stops once the token is cancelled
    init.shutdown.cancel();
    if let Err(e) = init.server_handle.await {
        tracing::warn!("HTTP server task ended abnormally: {}", e);
    }
    Ok(())
}
