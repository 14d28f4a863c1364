use alloy::primitives::B256;
use std::collections::{HashMap, VecDeque};
use tokio::sync::broadcast;

use crate::events::FinalityStatus;

/// Finality transitions, broadcast to downstream subscribers. Downgrades are
/// never silent: a reorg always produces a `Reverted` signal for every
/// affected event.
#[derive(Debug, Clone)]
pub enum FinalitySignal {
    Upgraded {
        event_id: B256,
        block_number: u64,
        status: FinalityStatus,
        confirmations: u64,
    },
    Reverted {
        event_id: B256,
        block_number: u64,
    },
}

struct TrackedEvent {
    block_number: u64,
    status: FinalityStatus,
}

/// Drives each tracked event through `pending → soft_confirmed → finalized`,
/// or straight to `reverted` when a reorg covers its height.
///
/// Tracking capacity is bounded; the oldest entries are evicted on overflow
/// regardless of status.
pub struct FinalityTracker {
    chain: String,
    soft_confirm_depth: u64,
    finality_depth: u64,
    capacity: usize,
    tracked: HashMap<B256, TrackedEvent>,
    insertion_order: VecDeque<B256>,
    tx: broadcast::Sender<FinalitySignal>,
}

impl FinalityTracker {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(chain: &str, soft_confirm_depth: u64, finality_depth: u64, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(4096);
        Self {
            chain: chain.to_string(),
            soft_confirm_depth,
            finality_depth,
            capacity,
            tracked: HashMap::new(),
            insertion_order: VecDeque::new(),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FinalitySignal> {
        self.tx.subscribe()
    }

    /// Begin tracking an event at its block height. Re-tracking an id already
    /// present (a reorg replay of the same block) is a no-op. At capacity the
    /// oldest entry is evicted and its id returned, so the caller can drop
    /// whatever state it keys on that id.
    pub fn track(&mut self, event_id: B256, block_number: u64) -> Option<B256> {
        if self.tracked.contains_key(&event_id) {
            return None;
        }
        let mut evicted = None;
        if self.tracked.len() >= self.capacity {
            if let Some(oldest) = self.insertion_order.pop_front() {
                self.tracked.remove(&oldest);
                tracing::debug!(
                    chain = %self.chain,
                    event_id = %oldest,
                    "Evicted oldest tracked event at capacity"
                );
                evicted = Some(oldest);
            }
        }
        self.tracked.insert(
            event_id,
            TrackedEvent {
                block_number,
                status: FinalityStatus::Pending,
            },
        );
        self.insertion_order.push_back(event_id);
        evicted
    }

    /// Status an event would have at the given confirmation count.
    fn status_for(&self, confirmations: u64) -> FinalityStatus {
        if confirmations >= self.finality_depth {
            FinalityStatus::Finalized
        } else if confirmations >= self.soft_confirm_depth {
            FinalityStatus::SoftConfirmed
        } else {
            FinalityStatus::Pending
        }
    }

    /// Advance confirmations for every tracked event against a new chain
    /// head. Reaching `finalized` is terminal and stops tracking. Returns the
    /// transitions, which are also broadcast.
    pub fn on_new_block(&mut self, height: u64) -> Vec<FinalitySignal> {
        let mut signals = Vec::new();
        let mut finalized = Vec::new();

        for (id, entry) in self.tracked.iter_mut() {
            if height < entry.block_number {
                // Precondition drift; the reorg path is responsible for
                // events above the head.
                continue;
            }
            let confirmations = height - entry.block_number;
            let next = if confirmations >= self.finality_depth {
                FinalityStatus::Finalized
            } else if confirmations >= self.soft_confirm_depth {
                FinalityStatus::SoftConfirmed
            } else {
                FinalityStatus::Pending
            };

            if next > entry.status {
                entry.status = next;
                signals.push(FinalitySignal::Upgraded {
                    event_id: *id,
                    block_number: entry.block_number,
                    status: next,
                    confirmations,
                });
            }
            if next == FinalityStatus::Finalized {
                finalized.push(*id);
            }
        }

        for id in finalized {
            self.tracked.remove(&id);
            self.insertion_order.retain(|x| x != &id);
        }

        for signal in &signals {
            let _ = self.tx.send(signal.clone());
        }
        signals
    }

    /// Revert every tracked event whose height falls inside the reorged
    /// range, removing it from tracking.
    pub fn on_reorg(&mut self, from_block: u64, to_block: u64) -> Vec<FinalitySignal> {
        let reverted: Vec<(B256, u64)> = self
            .tracked
            .iter()
            .filter(|(_, e)| e.block_number >= from_block && e.block_number <= to_block)
            .map(|(id, e)| (*id, e.block_number))
            .collect();

        let mut signals = Vec::with_capacity(reverted.len());
        for (id, block_number) in reverted {
            self.tracked.remove(&id);
            self.insertion_order.retain(|x| x != &id);
            let signal = FinalitySignal::Reverted {
                event_id: id,
                block_number,
            };
            let _ = self.tx.send(signal.clone());
            signals.push(signal);
        }

        if !signals.is_empty() {
            tracing::warn!(
                chain = %self.chain,
                from_block,
                to_block,
                reverted = signals.len(),
                "Reverted events in reorged range"
            );
        }
        signals
    }

    /// Initial status for a freshly decoded event at the current head.
    pub fn initial_status(&self, event_block: u64, head: u64) -> FinalityStatus {
        let confirmations = head.saturating_sub(event_block);
        self.status_for(confirmations)
    }

    /// Tracked-event counts by status, for the stats surface.
    pub fn counts(&self) -> FinalityCounts {
        let mut counts = FinalityCounts::default();
        for entry in self.tracked.values() {
            match entry.status {
                FinalityStatus::Pending => counts.pending += 1,
                FinalityStatus::SoftConfirmed => counts.soft_confirmed += 1,
                // Finalized and reverted entries leave the table.
                _ => {}
            }
        }
        counts
    }
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct FinalityCounts {
    pub pending: usize,
    pub soft_confirmed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> FinalityTracker {
        FinalityTracker::new("testnet", 3, 12, FinalityTracker::DEFAULT_CAPACITY)
    }

    fn id(byte: u8) -> B256 {
        B256::repeat_byte(byte)
    }

    #[test]
    fn test_monotonic_advancement() {
        let mut t = tracker();
        t.track(id(1), 100);

        assert!(t.on_new_block(101).is_empty()); // 1 conf, still pending

        let signals = t.on_new_block(103); // 3 confs
        assert_eq!(signals.len(), 1);
        assert!(matches!(
            signals[0],
            FinalitySignal::Upgraded {
                status: FinalityStatus::SoftConfirmed,
                confirmations: 3,
                ..
            }
        ));

        // No change between thresholds.
        assert!(t.on_new_block(110).is_empty());

        let signals = t.on_new_block(112); // 12 confs
        assert!(matches!(
            signals[0],
            FinalitySignal::Upgraded {
                status: FinalityStatus::Finalized,
                ..
            }
        ));

        // Finalized is terminal: tracking stopped.
        assert!(t.on_new_block(200).is_empty());
        let counts = t.counts();
        assert_eq!(counts.pending + counts.soft_confirmed, 0);
    }

    #[test]
    fn test_reorg_reverts_in_range() {
        let mut t = tracker();
        t.track(id(1), 100);
        t.track(id(2), 105);
        t.track(id(3), 110);
        t.on_new_block(110);

        let signals = t.on_reorg(104, 110);
        assert_eq!(signals.len(), 2);
        for s in &signals {
            assert!(matches!(s, FinalitySignal::Reverted { .. }));
        }

        // Reverted events are gone; a later head produces no transitions
        // for them, and only the survivor advances.
        let signals = t.on_new_block(120);
        assert_eq!(signals.len(), 1);
        assert!(matches!(
            signals[0],
            FinalitySignal::Upgraded {
                event_id,
                status: FinalityStatus::Finalized,
                ..
            } if event_id == id(1)
        ));
    }

    #[test]
    fn test_reorg_exactly_one_revert_regardless_of_status() {
        let mut t = tracker();
        t.track(id(1), 100);
        t.on_new_block(104); // soft confirmed

        let signals = t.on_reorg(100, 104);
        assert_eq!(signals.len(), 1);

        // Second reorg over the same range: nothing left to revert.
        assert!(t.on_reorg(100, 104).is_empty());
    }

    #[test]
    fn test_retrack_after_revert_is_fresh() {
        let mut t = tracker();
        t.track(id(1), 100);
        t.on_reorg(100, 100);

        // The replacement block's events have distinct ids; re-tracking the
        // reverted id itself also starts from pending.
        t.track(id(1), 101);
        let signals = t.on_new_block(104);
        assert!(matches!(
            signals[0],
            FinalitySignal::Upgraded {
                status: FinalityStatus::SoftConfirmed,
                confirmations: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_capacity_eviction() {
        let mut t = FinalityTracker::new("testnet", 3, 12, 3);
        assert_eq!(t.track(id(1), 100), None);
        assert_eq!(t.track(id(2), 101), None);
        assert_eq!(t.track(id(3), 102), None);
        // At capacity: the oldest id is evicted and handed back.
        assert_eq!(t.track(id(4), 103), Some(id(1)));

        let counts = t.counts();
        assert_eq!(counts.pending, 3);
        // id(1) no longer produces transitions.
        let signals = t.on_new_block(104);
        assert!(signals
            .iter()
            .all(|s| !matches!(s, FinalitySignal::Upgraded { event_id, .. } if *event_id == id(1))));
    }

    #[test]
    fn test_head_below_event_height_skipped() {
        let mut t = tracker();
        t.track(id(1), 100);
        // A stale head below the event height must not panic or underflow.
        assert!(t.on_new_block(99).is_empty());
    }

    #[test]
    fn test_initial_status_from_head() {
        let t = tracker();
        assert_eq!(t.initial_status(100, 100), FinalityStatus::Pending);
        assert_eq!(t.initial_status(100, 104), FinalityStatus::SoftConfirmed);
        assert_eq!(t.initial_status(100, 150), FinalityStatus::Finalized);
    }
}
