//! # Masking Job
//!
//! Runs the masking pipeline once, copying every table from a source database into a
//! destination database with the rules of a YAML file applied.
//!
//! ```bash
//! masking-job \
//!   --source "host=orders-db port=5432 user=postgres password=secret dbname=orders" \
//!   --destination "host=pr-123.dev.svc port=5432 user=postgres password=x dbname=orders" \
//!   --rules masking.yaml
//! ```
//!
//! The rules file holds a `rules:` list in the same shape as `spec.masking`.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vandal_controller::constants::DEFAULT_MASKING_MAX_CONCURRENT_TABLES;
use vandal_controller::database::{ConnectionInfo, DatabaseConnector, EngineConnector};
use vandal_controller::masking::MaskingPipeline;
use vandal_controller::runtime::{init_tracing, install_crypto_provider};
use vandal_controller::{DatabaseEngine, MaskingSpec};

#[derive(Parser)]
#[command(name = "masking-job")]
#[command(about = "Copy a database through the masking pipeline", long_about = None)]
struct Args {
    /// Source connection as `key=value` pairs
    #[arg(long, env = "MASKING_SOURCE")]
    source: String,

    /// Destination connection as `key=value` pairs
    #[arg(long, env = "MASKING_DESTINATION")]
    destination: String,

    /// YAML file with the masking rules
    #[arg(long, env = "MASKING_RULES")]
    rules: PathBuf,

    #[arg(long, env = "MASKING_ENGINE", default_value = "postgres")]
    engine: DatabaseEngine,

    /// Tables transferred at once, 0 for no limit
    #[arg(long, env = "MASKING_MAX_CONCURRENT_TABLES", default_value_t = DEFAULT_MASKING_MAX_CONCURRENT_TABLES)]
    max_concurrent_tables: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    install_crypto_provider();
    init_tracing("vandal_controller=info,masking_job=info");
    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.rules)
        .with_context(|| format!("Failed to read {}", args.rules.display()))?;
    let spec: MaskingSpec = serde_yaml::from_str(&raw)
        .with_context(|| format!("Invalid rules file {}", args.rules.display()))?;

    let source = ConnectionInfo::parse_keywords(&args.source).context("Invalid --source")?;
    let destination =
        ConnectionInfo::parse_keywords(&args.destination).context("Invalid --destination")?;

    let connector = EngineConnector::new(args.max_concurrent_tables);
    let source = connector.connect(args.engine, &source).await?;
    let destination = connector.connect(args.engine, &destination).await?;

    let pipeline = MaskingPipeline::new(source, destination, &spec.rules)?
        .with_max_concurrent_tables(args.max_concurrent_tables);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling transfers");
            on_signal.cancel();
        }
    });

    let report = pipeline.run(&cancel).await?;
    info!(
        "✅ Masked {} table(s), {} row(s)",
        report.tables, report.rows
    );
    Ok(())
}
