use alloy::primitives::B256;
use alloy::providers::Provider;
use alloy::rpc::types::BlockNumberOrTag;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::ChainConfig;
use crate::rpc::pool::RpcPool;

/// Signals emitted by the head tracker. A reorg always precedes re-tracking
/// of the heights it covers.
#[derive(Debug, Clone)]
pub enum ChainSignal {
    NewBlock {
        number: u64,
        hash: B256,
        parent_hash: B256,
        timestamp: u64,
    },
    Reorg {
        from_block: u64,
        to_block: u64,
        depth: u64,
    },
}

/// One entry in the sliding window of recent blocks.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
}

/// Tracks the chain head: keeps a bounded window of recent block hashes,
/// detects reorganizations, and broadcasts block/reorg signals.
pub struct HeadTracker {
    chain: String,
    window: BTreeMap<u64, BlockRecord>,
    window_size: u64,
    tx: broadcast::Sender<ChainSignal>,
}

impl HeadTracker {
    pub fn new(chain: &str, window_size: u64) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            chain: chain.to_string(),
            window: BTreeMap::new(),
            window_size,
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainSignal> {
        self.tx.subscribe()
    }

    /// Highest block height currently in the window.
    pub fn head(&self) -> Option<u64> {
        self.window.keys().next_back().copied()
    }

    /// Feed one observed block into the tracker. Returns the fork height when
    /// the block revealed a reorg, so the caller can re-fetch the replaced
    /// heights.
    ///
    /// Detects two reorg shapes: a different hash at an already-stored height,
    /// and a parent-hash mismatch against the stored previous block. Either
    /// purges the invalidated window entries and emits a reorg signal before
    /// the new block is accepted. Divergence deeper than the purged range
    /// resolves as the caller re-fetches downward, which re-runs this check
    /// per height.
    pub fn observe_block(&mut self, block: BlockRecord) -> Option<u64> {
        let head = self.head();
        let mut fork = None;

        if let Some(stored) = self.window.get(&block.number) {
            if stored.hash == block.hash {
                return None; // already seen
            }
            // Same height, different hash. If the new block links onto the
            // stored parent the fork is exactly this height; otherwise the
            // previous height is invalid too.
            let parent_ok = self
                .window
                .get(&(block.number.wrapping_sub(1)))
                .map(|p| p.hash == block.parent_hash)
                .unwrap_or(true);
            let from = if parent_ok || block.number == 0 {
                block.number
            } else {
                block.number - 1
            };
            self.emit_reorg(from, head.unwrap_or(block.number));
            fork = Some(from);
        } else if block.number > 0 {
            if let Some(prev) = self.window.get(&(block.number - 1)) {
                if prev.hash != block.parent_hash {
                    // The stored previous block is not this block's parent.
                    self.emit_reorg(block.number - 1, head.unwrap_or(block.number - 1));
                    fork = Some(block.number - 1);
                }
            }
        }

        let signal = ChainSignal::NewBlock {
            number: block.number,
            hash: block.hash,
            parent_hash: block.parent_hash,
            timestamp: block.timestamp,
        };
        self.window.insert(block.number, block);

        // Evict entries that fell out of the window.
        if let Some(newest) = self.head() {
            let cutoff = newest.saturating_sub(self.window_size);
            self.window.retain(|&n, _| n >= cutoff);
        }

        let _ = self.tx.send(signal);
        fork
    }

    fn emit_reorg(&mut self, from_block: u64, to_block: u64) {
        let depth = to_block.saturating_sub(from_block) + 1;
        tracing::warn!(
            chain = %self.chain,
            from_block,
            to_block,
            depth,
            "Reorg detected, purging invalidated window entries"
        );
        self.window.retain(|&n, _| n < from_block);
        let _ = self.tx.send(ChainSignal::Reorg {
            from_block,
            to_block,
            depth,
        });
    }
}

/// Poll the pool for the latest block and feed each new height into the
/// tracker, backfilling skipped heights individually so the head only ever
/// advances in order.
pub async fn run_head_tracker(
    mut tracker: HeadTracker,
    pool: Arc<RpcPool>,
    config: ChainConfig,
    shutdown: CancellationToken,
) -> eyre::Result<()> {
    let poll_interval = config.poll_interval();
    tracing::info!(
        chain = %config.name,
        poll_interval_ms = poll_interval.as_millis() as u64,
        "Head tracker polling active"
    );

    let mut last_seen: Option<u64> = None;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.cancelled() => {
                tracing::info!(chain = %config.name, "Shutdown received, stopping head tracker");
                break;
            }
        }

        let head = match pool
            .call_with_failover("eth_blockNumber", |p| async move {
                p.get_block_number().await
            })
            .await
        {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(chain = %config.name, error = %e, "Failed to get chain head");
                continue;
            }
        };

        let Some(start) = poll_start(last_seen, head) else {
            continue;
        };

        let mut number = start;
        while number <= head {
            if shutdown.is_cancelled() {
                break;
            }
            match fetch_block_record(&pool, number).await {
                Ok(Some(record)) => {
                    if let Some(fork) = tracker.observe_block(record) {
                        // Re-fetch from the fork point so the replacement
                        // blocks are observed and their logs re-derived.
                        last_seen = fork.checked_sub(1);
                        number = fork;
                        continue;
                    }
                    last_seen = Some(number);
                    number += 1;
                }
                Ok(None) => {
                    tracing::debug!(chain = %config.name, block = number, "Block not yet available");
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        chain = %config.name,
                        block = number,
                        error = %e,
                        "Failed to fetch block, retrying next poll"
                    );
                    break;
                }
            }
        }
    }

    Ok(())
}

/// First height to fetch for a poll. An unchanged head is re-fetched so a
/// same-height replacement block is still observed; a head behind the last
/// seen height waits for the chain to catch back up.
fn poll_start(last_seen: Option<u64>, head: u64) -> Option<u64> {
    match last_seen {
        Some(n) if head > n => Some(n + 1),
        Some(n) if head == n => Some(head),
        Some(_) => None,
        None => Some(head),
    }
}

async fn fetch_block_record(pool: &RpcPool, number: u64) -> eyre::Result<Option<BlockRecord>> {
    let block = pool
        .call_with_failover("eth_getBlockByNumber", |p| async move {
            p.get_block_by_number(BlockNumberOrTag::Number(number)).await
        })
        .await?;

    Ok(block.map(|b| BlockRecord {
        number,
        hash: b.header.hash,
        parent_hash: b.header.parent_hash,
        timestamp: b.header.timestamp,
    }))
}
