//! gridupd — the gridup daemon.
//!
//! Starts the embedded virtual cluster and serves the recommendation API:
//!
//! ```text
//! gridupd --port 8080 --provider aws --scoring-strategy cost-only
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use gridup_api::{ApiState, TemplateRevisionConfig};
use gridup_core::Quantity;
use gridup_engine::{EngineConfig, ScoringStrategy};
use gridup_pricing::PricingCatalog;
use gridup_vcluster::VirtualCluster;

#[derive(Parser)]
#[command(name = "gridupd", about = "gridup scale-up recommender daemon")]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Scoring strategy: cost-only, least-cost-per-unit, or
    /// cost-cpu-mem-wastage.
    #[arg(long, default_value = "cost-only")]
    scoring_strategy: String,

    /// Pricing provider for the embedded catalog (aws or gcp).
    #[arg(long, default_value = "aws")]
    provider: String,

    /// Optional pricing catalog JSON overriding the embedded one.
    #[arg(long)]
    pricing_path: Option<PathBuf>,

    /// Kube-reserved cpu deducted from every node template.
    #[arg(long, default_value = "80m")]
    kube_reserved_cpu: String,

    /// Kube-reserved memory deducted from every node template.
    #[arg(long, default_value = "1Gi")]
    kube_reserved_memory: String,

    /// Per-trial deadline for scheduling-event confirmation.
    #[arg(long, default_value = "10000")]
    trial_timeout_millis: u64,

    /// Seed for the winner tie-break RNG; random when unset.
    #[arg(long)]
    tie_break_seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gridupd=debug,gridup=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let strategy: ScoringStrategy = cli
        .scoring_strategy
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .context("invalid --scoring-strategy")?;
    let kube_reserved_cpu: Quantity = cli
        .kube_reserved_cpu
        .parse()
        .context("invalid --kube-reserved-cpu")?;
    let kube_reserved_memory: Quantity = cli
        .kube_reserved_memory
        .parse()
        .context("invalid --kube-reserved-memory")?;

    let catalog = match &cli.pricing_path {
        Some(path) => PricingCatalog::from_json_file(path)
            .with_context(|| format!("failed to load pricing catalog from {}", path.display()))?,
        None => PricingCatalog::builtin(&cli.provider).context("invalid --provider")?,
    };

    info!(
        port = cli.port,
        strategy = %strategy,
        provider = %cli.provider,
        "gridup daemon starting"
    );

    let cluster = VirtualCluster::start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = ApiState::new(
        cluster.clone(),
        Arc::new(catalog),
        strategy,
        EngineConfig {
            trial_timeout: Duration::from_millis(cli.trial_timeout_millis),
            tie_break_seed: cli.tie_break_seed,
        },
        TemplateRevisionConfig {
            kube_reserved_cpu,
            kube_reserved_memory,
        },
        shutdown_rx,
    );

    let router = gridup_api::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    cluster.stop().await;
    info!("gridup daemon stopped");
    Ok(())
}
