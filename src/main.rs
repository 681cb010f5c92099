//! pullcast - pull-based metrics collection agent core.
//!
//! Loads a declarative scrape configuration, runs one scheduler per target,
//! and hands scrape results to the downstream storage/alerting collaborators.

mod config;
mod notify;
mod scheduler;
mod scrape;
mod sink;
mod target;

use scheduler::SchedulerPool;
use scrape::HttpFetcher;
use sink::{ResultSink, ScrapeUpdate};

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RESULT_CHANNEL_CAPACITY: usize = 1000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pullcast=info".parse()?))
        .init();

    // Load configuration; invalid configuration aborts startup before any
    // scheduler starts.
    let config_path = std::env::var("PULLCAST_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("pullcast.yml"));
    tracing::info!("Loading configuration from {}", config_path.display());
    let cfg = config::load(&config_path)?;
    tracing::info!(
        "Loaded {} scrape targets, {} alertmanager endpoints, {} rule files",
        cfg.targets.len(),
        cfg.alertmanagers.len(),
        cfg.rule_files.len()
    );
    for rule_file in &cfg.rule_files {
        tracing::info!(
            "Rule file {} evaluated externally every {:?}",
            rule_file.display(),
            cfg.evaluation_interval
        );
    }

    // Downstream handoff: the consumer of this receiver is the external
    // parsing/storage collaborator.
    let (sink, rx) = ResultSink::channel(RESULT_CHANNEL_CAPACITY);
    tokio::spawn(run_result_consumer(rx));

    // Alert forwarding boundary for the external rule evaluator.
    let _notifier = notify::Notifier::new(cfg.alertmanagers.clone());

    // Start scraping.
    let pool = Arc::new(SchedulerPool::new(Arc::new(HttpFetcher), sink));
    pool.reconcile(cfg.targets).await?;
    tracing::info!("Scheduler pool started with {} targets", pool.target_count().await);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    pool.shutdown().await;

    Ok(())
}

/// Drain the result channel on behalf of the storage collaborator.
async fn run_result_consumer(mut rx: mpsc::Receiver<ScrapeUpdate>) {
    while let Some(update) = rx.recv().await {
        match update {
            ScrapeUpdate::Result(result) => {
                tracing::debug!(
                    "Scrape of {} finished in {:?}: {}",
                    result.target.id(),
                    result.duration,
                    if result.outcome.is_success() { "ok" } else { "failed" }
                );
            }
            ScrapeUpdate::SkippedTick { target, at } => {
                tracing::debug!("Skipped tick for {} at {}", target.id(), at);
            }
        }
    }
}
