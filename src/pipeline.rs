use alloy::primitives::B256;
use alloy::rpc::types::Log;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::alerts::aggregator::Aggregator;
use crate::alerts::noise::{NoiseFilter, NoiseStats};
use crate::alerts::types::Alert;
use crate::chain::fetcher::fetch_logs;
use crate::chain::head::ChainSignal;
use crate::config::{ChainConfig, Config};
use crate::decode::EventDecoder;
use crate::events::{CanonicalEvent, FinalityStatus};
use crate::finality::{FinalityCounts, FinalitySignal, FinalityTracker};
use crate::intel::anomaly::AnomalyDetector;
use crate::intel::profiler::WalletProfiler;
use crate::rpc::pool::RpcPool;
use crate::rules::evaluator;
use crate::rules::loader::RuleStore;
use crate::rules::types::RuleSet;
use crate::rules::watch::WatchCache;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Cross-chain behavioral state, shared by every chain pipeline.
pub struct Intel {
    pub anomaly: AnomalyDetector,
    pub profiler: WalletProfiler,
}

impl Intel {
    pub fn new(config: &Config) -> Self {
        Self {
            anomaly: AnomalyDetector::new(config.anomaly.clone()),
            profiler: WalletProfiler::new(config.profiler.clone()),
        }
    }
}

/// Point-in-time pipeline snapshot for the periodic stats log.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineStats {
    pub chain: String,
    pub head: Option<u64>,
    pub providers_healthy: usize,
    pub providers_total: usize,
    pub tracked: FinalityCounts,
    pub held_events: usize,
    pub open_windows: usize,
    pub active_rules: usize,
    pub noise: NoiseStats,
}

/// Per-chain processing pipeline: consumes head-tracker signals, fetches and
/// decodes the logs the active rules ask for, drives finality, evaluates
/// rules, and pushes surviving alerts to the shared sink channel.
pub struct ChainPipeline {
    config: ChainConfig,
    pool: Arc<RpcPool>,
    decoder: EventDecoder,
    rules: Arc<RuleStore>,
    watch: WatchCache,
    finality: FinalityTracker,
    aggregator: Aggregator,
    noise: NoiseFilter,
    /// Events still short of finalized, kept so finality upgrades can
    /// re-evaluate rules gated on a higher status. Bounded in practice by
    /// the finality tracker's capacity and the reorg window.
    held: HashMap<B256, CanonicalEvent>,
    intel: Arc<Mutex<Intel>>,
    alert_tx: broadcast::Sender<Alert>,
    head: Option<u64>,
}

impl ChainPipeline {
    pub fn new(
        config: ChainConfig,
        app_config: &Config,
        pool: Arc<RpcPool>,
        rules: Arc<RuleStore>,
        intel: Arc<Mutex<Intel>>,
        alert_tx: broadcast::Sender<Alert>,
    ) -> Self {
        let finality = FinalityTracker::new(
            &config.name,
            config.soft_confirm_depth,
            config.finality_depth,
            FinalityTracker::DEFAULT_CAPACITY,
        );
        let watch = WatchCache::new(config.chain_id);
        Self {
            config,
            pool,
            decoder: EventDecoder::new(),
            rules,
            watch,
            finality,
            aggregator: Aggregator::new(),
            noise: NoiseFilter::new(&app_config.noise),
            held: HashMap::new(),
            intel,
            alert_tx,
            head: None,
        }
    }

    pub fn subscribe_finality(&self) -> broadcast::Receiver<FinalitySignal> {
        self.finality.subscribe()
    }

    #[cfg(test)]
    fn set_finality_capacity(&mut self, capacity: usize) {
        self.finality = FinalityTracker::new(
            &self.config.name,
            self.config.soft_confirm_depth,
            self.config.finality_depth,
            capacity,
        );
    }

    /// Fetch and process the logs for one new block, then advance finality.
    async fn handle_new_block(&mut self, number: u64, timestamp: u64) {
        let targets: Vec<_> = self
            .watch
            .targets(&self.rules, self.decoder.registry())
            .to_vec();

        match fetch_logs(&self.pool, &targets, number, number).await {
            Ok(logs) => {
                if !logs.is_empty() {
                    tracing::debug!(
                        chain = %self.config.name,
                        block = number,
                        logs = logs.len(),
                        "Fetched logs for block"
                    );
                }
                self.process_logs(&logs, number, timestamp).await;
            }
            Err(e) => {
                tracing::warn!(
                    chain = %self.config.name,
                    block = number,
                    error = %e,
                    "Log fetch failed, block skipped"
                );
            }
        }

        self.advance_head(number);
    }

    /// Decode a batch of fetched logs and run every decoded event through
    /// rule evaluation and the behavioral detectors.
    pub async fn process_logs(&mut self, logs: &[Log], head: u64, block_timestamp: u64) {
        self.head = Some(head);
        let timestamp = DateTime::<Utc>::from_timestamp(block_timestamp as i64, 0)
            .unwrap_or_else(Utc::now);

        for log in logs {
            let Some(block_number) = log.block_number else {
                continue;
            };
            let initial = self.finality.initial_status(block_number, head);
            let Some(mut event) = self
                .decoder
                .decode(self.config.chain_id, log, initial, timestamp)
            else {
                continue;
            };
            event.confirmations = head.saturating_sub(block_number);

            if let Some(evicted) = self.finality.track(event.id, event.block_number) {
                // The tracker will never report on the evicted event again,
                // so its held entry would otherwise leak.
                self.held.remove(&evicted);
            }

            {
                let mut intel = self.intel.lock().await;
                if let Some(verdict) = intel.anomaly.observe(&event) {
                    tracing::warn!(
                        chain = %self.config.name,
                        asset = %verdict.asset,
                        amount = verdict.amount,
                        z_score = verdict.z_score,
                        severity = verdict.severity.as_str(),
                        confidence = verdict.confidence,
                        "Anomalous amount"
                    );
                }
                intel.profiler.observe(&event);
            }

            self.evaluate(&event, None);

            if event.finality < FinalityStatus::Finalized {
                self.held.insert(event.id, event);
            }
        }
    }

    /// Advance the finality tracker to a new head and act on the
    /// transitions: upgrades re-evaluate finality-gated rules, finalization
    /// releases the held event.
    pub fn advance_head(&mut self, number: u64) {
        self.head = Some(number);
        let transitions = self.finality.on_new_block(number);

        for signal in transitions {
            match signal {
                FinalitySignal::Upgraded {
                    event_id,
                    status,
                    confirmations,
                    ..
                } => {
                    let Some(event) = self.held.get_mut(&event_id) else {
                        continue;
                    };
                    event.finality = status;
                    event.confirmations = confirmations;
                    let event = event.clone();

                    // Rules gated exactly on the new status fire now; lower
                    // gates already fired when the event was decoded.
                    self.evaluate(&event, Some(status));

                    if status == FinalityStatus::Finalized {
                        self.held.remove(&event_id);
                    }
                }
                FinalitySignal::Reverted { event_id, .. } => {
                    self.held.remove(&event_id);
                }
            }
        }
    }

    /// Drop everything invalidated by a reorg. The replacement blocks arrive
    /// as ordinary new-block signals and are re-processed under fresh ids.
    pub fn handle_reorg(&mut self, from_block: u64, to_block: u64) {
        let reverted = self.finality.on_reorg(from_block, to_block);
        for signal in reverted {
            if let FinalitySignal::Reverted { event_id, .. } = signal {
                self.held.remove(&event_id);
            }
        }
    }

    /// Run the active rule set against one event. With `gate` set, only
    /// rules whose finality gate equals that status are considered.
    fn evaluate(&mut self, event: &CanonicalEvent, gate: Option<FinalityStatus>) {
        let set = self.rules.current();
        let mut alerts = Vec::new();
        let now = Instant::now();

        for rule in &set.rules {
            if let Some(gate) = gate {
                if rule.min_finality != gate {
                    continue;
                }
            }
            if evaluator::matches(rule, event) {
                alerts.extend(self.aggregator.process_match(rule, event, now));
            }
        }
        self.emit(alerts, &set, now);
    }

    fn emit(&mut self, alerts: Vec<Alert>, set: &RuleSet, now: Instant) {
        for alert in alerts {
            let cooldown = set
                .get(alert.rule_id())
                .map(|r| Duration::from_secs(r.cooldown_secs))
                .unwrap_or(Duration::ZERO);
            if self.noise.should_pass(&alert, cooldown, now) {
                let _ = self.alert_tx.send(alert);
            }
        }
    }

    /// Flush aggregation windows whose deadline has passed.
    pub fn sweep(&mut self, now: Instant) {
        let due = self.aggregator.flush_due(now);
        if !due.is_empty() {
            let set = self.rules.current();
            self.emit(due, &set, now);
        }
    }

    /// Flush every open window unconditionally. Shutdown path.
    pub fn flush(&mut self) {
        let pending = self.aggregator.flush_all();
        if !pending.is_empty() {
            tracing::info!(
                chain = %self.config.name,
                windows = pending.len(),
                "Flushing open aggregation windows on shutdown"
            );
            let set = self.rules.current();
            self.emit(pending, &set, Instant::now());
        }
    }

    pub fn stats(&self) -> PipelineStats {
        let (providers_healthy, providers_total) = self.pool.stats();
        PipelineStats {
            chain: self.config.name.clone(),
            head: self.head,
            providers_healthy,
            providers_total,
            tracked: self.finality.counts(),
            held_events: self.held.len(),
            open_windows: self.aggregator.open_windows(),
            active_rules: self.rules.current().len(),
            noise: self.noise.stats(),
        }
    }

    fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            chain = %stats.chain,
            head = stats.head,
            providers_healthy = stats.providers_healthy,
            providers_total = stats.providers_total,
            pending = stats.tracked.pending,
            soft_confirmed = stats.tracked.soft_confirmed,
            held_events = stats.held_events,
            open_windows = stats.open_windows,
            active_rules = stats.active_rules,
            alerts_passed = stats.noise.passed,
            suppressed_dedup = stats.noise.suppressed_dedup,
            suppressed_cooldown = stats.noise.suppressed_cooldown,
            "Pipeline stats"
        );
    }
}

/// Per-chain task: drive the pipeline from head-tracker signals until
/// shutdown.
pub async fn run_chain_pipeline(
    mut pipeline: ChainPipeline,
    mut signals: broadcast::Receiver<ChainSignal>,
    shutdown: CancellationToken,
) {
    let chain = pipeline.config.name.clone();
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    let mut stats = tokio::time::interval(STATS_INTERVAL);
    tracing::info!(chain = %chain, "Chain pipeline started");

    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Ok(ChainSignal::NewBlock { number, timestamp, .. }) => {
                    pipeline.handle_new_block(number, timestamp).await;
                }
                Ok(ChainSignal::Reorg { from_block, to_block, depth }) => {
                    tracing::warn!(
                        chain = %chain,
                        from_block,
                        to_block,
                        depth,
                        "Handling reorg"
                    );
                    pipeline.handle_reorg(from_block, to_block);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(chain = %chain, missed, "Pipeline lagged behind head tracker");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!(chain = %chain, "Head tracker channel closed");
                    break;
                }
            },
            _ = sweep.tick() => {
                pipeline.sweep(Instant::now());
            }
            _ = stats.tick() => {
                pipeline.log_stats();
            }
            _ = shutdown.cancelled() => {
                tracing::info!(chain = %chain, "Shutdown received, stopping pipeline");
                break;
            }
        }
    }

    pipeline.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::registry::erc20_transfer_signature;
    use crate::decode::test_support::{make_log, word_from_address};
    use alloy::primitives::{Address, U256};
    use std::io::Write;
    use std::path::PathBuf;

    fn write_rules(content: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "chainsentry-pipeline-{}-{}.toml",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    fn chain_config() -> ChainConfig {
        ChainConfig {
            name: "testnet".to_string(),
            chain_id: 1,
            endpoints: vec!["http://localhost:18545".to_string()],
            block_time_ms: 12_000,
            soft_confirm_depth: 3,
            finality_depth: 12,
            poll_interval_ms: None,
            reorg_window: 64,
        }
    }

    fn pipeline_with_rules(rules: &str) -> (ChainPipeline, broadcast::Receiver<Alert>, PathBuf) {
        let path = write_rules(rules);
        let store = Arc::new(RuleStore::load(&path).unwrap());
        let app_config: Config = toml::from_str(
            r#"
[[chains]]
name = "testnet"
chain_id = 1
endpoints = ["http://localhost:18545"]
"#,
        )
        .unwrap();
        let pool = Arc::new(RpcPool::new("testnet", &chain_config().endpoints, 3).unwrap());
        let intel = Arc::new(Mutex::new(Intel::new(&app_config)));
        let (alert_tx, alert_rx) = broadcast::channel(256);
        let pipeline = ChainPipeline::new(
            chain_config(),
            &app_config,
            pool,
            store,
            intel,
            alert_tx,
        );
        (pipeline, alert_rx, path)
    }

    fn transfer_log(block: u64, log_index: u64, value: u64) -> Log {
        make_log(
            Address::repeat_byte(0xcc),
            vec![
                erc20_transfer_signature(),
                word_from_address(Address::repeat_byte(0x11)),
                word_from_address(Address::repeat_byte(0x22)),
            ],
            U256::from(value).to_be_bytes::<32>().to_vec(),
            block,
            B256::repeat_byte(block as u8),
            B256::repeat_byte(0xab),
            log_index,
        )
    }

    fn drain(rx: &mut broadcast::Receiver<Alert>) -> Vec<Alert> {
        let mut alerts = Vec::new();
        while let Ok(a) = rx.try_recv() {
            alerts.push(a);
        }
        alerts
    }

    const INSTANT_RULE: &str = r#"
[[rules]]
id = "big-transfer"
event_type = "transfer"
severity = "high"

[[rules.conditions]]
kind = "amount_cmp"
field = "value"
op = "gte"
value = "1000"
"#;

    #[tokio::test]
    async fn test_matching_log_produces_alert() {
        let (mut pipeline, mut rx, path) = pipeline_with_rules(INSTANT_RULE);

        pipeline
            .process_logs(&[transfer_log(100, 0, 5000)], 100, 1_700_000_000)
            .await;

        let alerts = drain(&mut rx);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id(), "big-transfer");

        // Below the threshold: no alert.
        pipeline
            .process_logs(&[transfer_log(101, 0, 10)], 101, 1_700_000_012)
            .await;
        assert!(drain(&mut rx).is_empty());
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_finality_gated_rule_fires_on_upgrade() {
        let rules = r#"
[[rules]]
id = "confirmed-transfer"
event_type = "transfer"
severity = "high"
min_finality = "soft_confirmed"
"#;
        let (mut pipeline, mut rx, path) = pipeline_with_rules(rules);

        // Decoded at the head: pending, the gated rule stays quiet.
        pipeline
            .process_logs(&[transfer_log(100, 0, 5000)], 100, 1_700_000_000)
            .await;
        assert!(drain(&mut rx).is_empty());

        pipeline.advance_head(102);
        assert!(drain(&mut rx).is_empty());

        // Three confirmations: soft confirmed, the rule fires exactly once.
        pipeline.advance_head(103);
        let alerts = drain(&mut rx);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id(), "confirmed-transfer");

        pipeline.advance_head(104);
        assert!(drain(&mut rx).is_empty());
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_reorg_replay_is_deduplicated() {
        let (mut pipeline, mut rx, path) = pipeline_with_rules(INSTANT_RULE);

        let log = transfer_log(100, 0, 5000);
        pipeline.process_logs(&[log.clone()], 100, 1_700_000_000).await;
        assert_eq!(drain(&mut rx).len(), 1);

        // Reorg covering the block, then the same block replayed: the event
        // id is identical, so the alert is suppressed.
        pipeline.handle_reorg(100, 100);
        pipeline.process_logs(&[log], 100, 1_700_000_000).await;
        assert!(drain(&mut rx).is_empty());
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_reorg_sibling_block_alerts_fresh() {
        let (mut pipeline, mut rx, path) = pipeline_with_rules(INSTANT_RULE);

        pipeline
            .process_logs(&[transfer_log(100, 0, 5000)], 100, 1_700_000_000)
            .await;
        drain(&mut rx);

        pipeline.handle_reorg(100, 100);

        // The replacement block has a different hash, so its event id is new.
        let mut sibling = transfer_log(100, 0, 5000);
        sibling.block_hash = Some(B256::repeat_byte(0x77));
        pipeline.process_logs(&[sibling], 100, 1_700_000_000).await;
        assert_eq!(drain(&mut rx).len(), 1);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_aggregated_rule_flushes_on_sweep() {
        let rules = r#"
[[rules]]
id = "transfer-volume"
event_type = "transfer"
severity = "low"

[rules.aggregation]
window_secs = 60
summary = "count"
"#;
        let (mut pipeline, mut rx, path) = pipeline_with_rules(rules);

        for i in 0..3u64 {
            pipeline
                .process_logs(&[transfer_log(100 + i, i, 500)], 100 + i, 1_700_000_000)
                .await;
        }
        assert!(drain(&mut rx).is_empty());
        assert_eq!(pipeline.stats().open_windows, 1);

        pipeline.sweep(Instant::now() + Duration::from_secs(61));
        let alerts = drain(&mut rx);
        assert_eq!(alerts.len(), 1);
        let Alert::Aggregated { summary, .. } = &alerts[0] else {
            panic!("expected aggregated alert");
        };
        assert_eq!(summary.event_count, 3);
        assert_eq!(pipeline.stats().open_windows, 0);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_tracker_eviction_releases_held_event() {
        let (mut pipeline, _rx, path) = pipeline_with_rules(INSTANT_RULE);
        pipeline.set_finality_capacity(2);

        // Three distinct pending events against a capacity of two: tracking
        // the third evicts the oldest, which must also leave the held map.
        for i in 0..3u64 {
            pipeline
                .process_logs(&[transfer_log(100 + i, 0, 5000)], 100 + i, 1_700_000_000)
                .await;
        }
        assert_eq!(pipeline.stats().held_events, 2);

        // Past the finality depth the survivors finalize and are released;
        // nothing may linger behind the drained tracker.
        pipeline.advance_head(200);
        let stats = pipeline.stats();
        assert_eq!(stats.tracked.pending + stats.tracked.soft_confirmed, 0);
        assert_eq!(stats.held_events, 0);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let (mut pipeline, _rx, path) = pipeline_with_rules(INSTANT_RULE);

        pipeline
            .process_logs(&[transfer_log(100, 0, 5000)], 100, 1_700_000_000)
            .await;

        let stats = pipeline.stats();
        assert_eq!(stats.chain, "testnet");
        assert_eq!(stats.head, Some(100));
        assert_eq!(stats.providers_total, 1);
        assert_eq!(stats.tracked.pending, 1);
        assert_eq!(stats.held_events, 1);
        assert_eq!(stats.active_rules, 1);
        assert_eq!(stats.noise.passed, 1);
        std::fs::remove_file(path).ok();
    }
}
