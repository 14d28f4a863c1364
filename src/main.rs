use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use chainsentry::alerts::types::Alert;
use chainsentry::chain::head::{run_head_tracker, HeadTracker};
use chainsentry::config::Config;
use chainsentry::pipeline::{run_chain_pipeline, ChainPipeline, Intel};
use chainsentry::rpc::pool::{run_health_checks, RpcPool};
use chainsentry::rules::loader::{watch_rule_file, RuleStore};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    // Initialize structured logging (set RUST_LOG=info for output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    tracing::info!("ChainSentry starting");

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path)?;
    tracing::info!(
        chains = config.chains.len(),
        "Configuration loaded from {}",
        config_path
    );

    // Load the rule set and keep it hot-reloading
    let rules = Arc::new(RuleStore::load(&config.rules.path)?);
    let shutdown = CancellationToken::new();

    tokio::spawn(watch_rule_file(
        rules.clone(),
        Duration::from_secs(config.rules.reload_poll_secs),
        shutdown.clone(),
    ));

    // Cross-chain behavioral state, shared by every pipeline
    let intel = Arc::new(Mutex::new(Intel::new(&config)));
    tokio::spawn(run_intel_stats(intel.clone(), shutdown.clone()));

    // Alert sink: every surviving alert lands here
    let (alert_tx, alert_rx) = broadcast::channel::<Alert>(1024);
    let sink = tokio::spawn(run_alert_sink(alert_rx));

    // One provider pool, head tracker and pipeline per chain
    let mut handles = Vec::new();
    for chain_config in config.chains.clone() {
        let pool = Arc::new(RpcPool::new(
            &chain_config.name,
            &chain_config.endpoints,
            config.rpc.max_consecutive_errors,
        )?);

        tokio::spawn(run_health_checks(
            pool.clone(),
            Duration::from_secs(config.rpc.health_check_secs),
            shutdown.clone(),
        ));

        let tracker = HeadTracker::new(&chain_config.name, chain_config.reorg_window);
        let signals = tracker.subscribe();

        let pipeline = ChainPipeline::new(
            chain_config.clone(),
            &config,
            pool.clone(),
            rules.clone(),
            intel.clone(),
            alert_tx.clone(),
        );

        handles.push(tokio::spawn(run_chain_pipeline(
            pipeline,
            signals,
            shutdown.clone(),
        )));

        let chain_name = chain_config.name.clone();
        let head_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_head_tracker(tracker, pool, chain_config, head_shutdown).await {
                tracing::error!(chain = %chain_name, error = %e, "Head tracker failed");
            }
        }));
    }

    tracing::info!("All chain pipelines started. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping all pipelines...");
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }

    // The pipelines have flushed their final alerts; close the channel and
    // let the sink drain before the runtime tears down.
    drop(alert_tx);
    let _ = sink.await;

    tracing::info!("ChainSentry stopped gracefully");
    Ok(())
}

/// Periodic cross-chain intel summary: the wallet risk leaderboard and
/// per-asset baselines.
async fn run_intel_stats(intel: Arc<Mutex<Intel>>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(300));
    interval.tick().await; // the first tick fires immediately
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        let intel = intel.lock().await;
        for entry in intel.profiler.risk_leaderboard(10) {
            tracing::info!(
                wallet = %entry.wallet,
                score = entry.score,
                level = ?entry.level,
                actions = entry.total_actions,
                contracts = entry.contracts,
                patterns = entry.patterns,
                last_seen = %entry.last_seen,
                "Wallet risk"
            );
        }
        for stats in intel.anomaly.asset_stats() {
            tracing::debug!(
                chain_id = stats.chain_id,
                asset = %stats.asset,
                samples = stats.sample_count,
                mean = stats.mean,
                std_dev = stats.std_dev,
                "Asset baseline"
            );
        }
    }
}

/// Terminal alert sink: renders surviving alerts as structured log lines.
async fn run_alert_sink(mut rx: broadcast::Receiver<Alert>) {
    loop {
        match rx.recv().await {
            Ok(Alert::Instant {
                rule_id,
                rule_name,
                severity,
                event,
            }) => {
                tracing::info!(
                    rule = %rule_id,
                    name = %rule_name,
                    severity = severity.as_str(),
                    chain_id = event.chain_id,
                    event = %event.name,
                    contract = %event.contract,
                    block = event.block_number,
                    tx = %event.tx_hash,
                    finality = event.finality.as_str(),
                    "ALERT"
                );
            }
            Ok(Alert::Aggregated {
                rule_id,
                rule_name,
                severity,
                summary,
                ..
            }) => {
                tracing::info!(
                    rule = %rule_id,
                    name = %rule_name,
                    severity = severity.as_str(),
                    group = %summary.group_key,
                    events = summary.event_count,
                    first_block = summary.first_block,
                    last_block = summary.last_block,
                    unique_senders = summary.unique_senders,
                    summary = ?summary.summary,
                    "AGGREGATED ALERT"
                );
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Alert sink lagged, alerts dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
