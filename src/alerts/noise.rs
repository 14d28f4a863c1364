use alloy::primitives::B256;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::config::NoiseConfig;
use crate::rules::types::Severity;

use super::types::Alert;

/// Gates candidate alerts before they reach the sink: a minimum-severity
/// floor, per-event dedup (reorg replays re-deliver the same event id), and
/// a per-rule cooldown.
pub struct NoiseFilter {
    min_severity: Severity,
    dedup_cap: usize,
    seen: HashSet<(String, B256)>,
    seen_order: VecDeque<(String, B256)>,
    last_fired: HashMap<String, Instant>,
    stats: NoiseStats,
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct NoiseStats {
    pub passed: u64,
    pub suppressed_severity: u64,
    pub suppressed_dedup: u64,
    pub suppressed_cooldown: u64,
}

impl NoiseFilter {
    pub fn new(config: &NoiseConfig) -> Self {
        Self {
            min_severity: config.min_severity,
            dedup_cap: config.dedup_cap,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            last_fired: HashMap::new(),
            stats: NoiseStats::default(),
        }
    }

    /// Decide whether an alert passes. `cooldown` comes from the matched
    /// rule; passing records both the dedup entry and the cooldown deadline.
    pub fn should_pass(&mut self, alert: &Alert, cooldown: Duration, now: Instant) -> bool {
        if alert.severity() < self.min_severity {
            self.stats.suppressed_severity += 1;
            return false;
        }

        // Dedup applies to instant alerts only: aggregated summaries are
        // already unique per flush. The seen entry is recorded only once the
        // alert actually passes, so a cooldown suppression does not block the
        // same event from firing later.
        let dedup_key = if let Alert::Instant { rule_id, event, .. } = alert {
            let key = (rule_id.clone(), event.id);
            if self.seen.contains(&key) {
                self.stats.suppressed_dedup += 1;
                return false;
            }
            Some(key)
        } else {
            None
        };

        let cooldown_key = alert.cooldown_key();
        if cooldown > Duration::ZERO {
            if let Some(last) = self.last_fired.get(&cooldown_key) {
                if now.saturating_duration_since(*last) < cooldown {
                    self.stats.suppressed_cooldown += 1;
                    return false;
                }
            }
        }

        if let Some(key) = dedup_key {
            self.record_seen(key);
        }
        self.last_fired.insert(cooldown_key, now);
        self.stats.passed += 1;
        true
    }

    fn record_seen(&mut self, key: (String, B256)) {
        self.seen.insert(key.clone());
        self.seen_order.push_back(key);

        // Prune to the newer half once over the cap.
        if self.seen.len() > self.dedup_cap {
            let drop_count = self.seen_order.len() / 2;
            for _ in 0..drop_count {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen.remove(&old);
                }
            }
            tracing::debug!(
                dropped = drop_count,
                retained = self.seen.len(),
                "Pruned alert dedup set"
            );
        }
    }

    pub fn stats(&self) -> NoiseStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CanonicalEvent, EventCategory, FinalityStatus};
    use alloy::primitives::Address;
    use chrono::Utc;
    use std::collections::HashMap as StdHashMap;

    fn make_event(id_byte: u8) -> CanonicalEvent {
        CanonicalEvent {
            id: B256::repeat_byte(id_byte),
            chain_id: 1,
            block_number: 100,
            block_hash: B256::repeat_byte(1),
            tx_hash: B256::repeat_byte(2),
            log_index: 0,
            contract: Address::repeat_byte(0xcc),
            name: "Transfer".to_string(),
            category: EventCategory::Transfer,
            args: StdHashMap::new(),
            finality: FinalityStatus::Pending,
            confirmations: 0,
            timestamp: Utc::now(),
        }
    }

    fn instant(rule: &str, severity: Severity, id_byte: u8) -> Alert {
        Alert::Instant {
            rule_id: rule.to_string(),
            rule_name: rule.to_string(),
            severity,
            event: make_event(id_byte),
        }
    }

    fn filter(min: Severity) -> NoiseFilter {
        NoiseFilter::new(&NoiseConfig {
            min_severity: min,
            dedup_cap: 8,
        })
    }

    #[test]
    fn test_severity_floor() {
        let mut f = filter(Severity::High);
        let now = Instant::now();
        assert!(!f.should_pass(&instant("r", Severity::Medium, 1), Duration::ZERO, now));
        assert!(f.should_pass(&instant("r", Severity::High, 2), Duration::ZERO, now));
        assert_eq!(f.stats().suppressed_severity, 1);
        assert_eq!(f.stats().passed, 1);
    }

    #[test]
    fn test_dedup_suppresses_replay() {
        let mut f = filter(Severity::Low);
        let now = Instant::now();
        let alert = instant("r", Severity::High, 1);

        assert!(f.should_pass(&alert, Duration::ZERO, now));
        // A reorg replay of the same (rule, event id) is suppressed forever.
        assert!(!f.should_pass(&alert, Duration::ZERO, now + Duration::from_secs(3600)));
        assert_eq!(f.stats().suppressed_dedup, 1);
    }

    #[test]
    fn test_dedup_is_per_rule() {
        let mut f = filter(Severity::Low);
        let now = Instant::now();
        assert!(f.should_pass(&instant("r1", Severity::High, 1), Duration::ZERO, now));
        assert!(f.should_pass(&instant("r2", Severity::High, 1), Duration::ZERO, now));
    }

    #[test]
    fn test_cooldown_idempotence() {
        let mut f = filter(Severity::Low);
        let now = Instant::now();
        let cooldown = Duration::from_secs(60);

        assert!(f.should_pass(&instant("r", Severity::High, 1), cooldown, now));
        // A different event for the same rule inside the cooldown window.
        assert!(!f.should_pass(
            &instant("r", Severity::High, 2),
            cooldown,
            now + Duration::from_secs(30)
        ));
        // After the cooldown elapses it may fire again.
        assert!(f.should_pass(
            &instant("r", Severity::High, 3),
            cooldown,
            now + Duration::from_secs(61)
        ));
        assert_eq!(f.stats().suppressed_cooldown, 1);
    }

    #[test]
    fn test_cooldown_suppression_leaves_no_dedup_entry() {
        let mut f = filter(Severity::Low);
        let now = Instant::now();
        let cooldown = Duration::from_secs(60);

        assert!(f.should_pass(&instant("r", Severity::High, 1), cooldown, now));
        // Suppressed by cooldown, not delivered.
        assert!(!f.should_pass(
            &instant("r", Severity::High, 2),
            cooldown,
            now + Duration::from_secs(30)
        ));
        // The same event must still be eligible once the cooldown elapses;
        // only delivered alerts count as seen.
        assert!(f.should_pass(
            &instant("r", Severity::High, 2),
            cooldown,
            now + Duration::from_secs(61)
        ));
    }

    #[test]
    fn test_aggregated_cooldown_key_is_separate() {
        let mut f = filter(Severity::Low);
        let now = Instant::now();
        let cooldown = Duration::from_secs(60);

        assert!(f.should_pass(&instant("r", Severity::High, 1), cooldown, now));

        let aggregated = Alert::Aggregated {
            rule_id: "r".to_string(),
            rule_name: "r".to_string(),
            severity: Severity::High,
            summary: crate::alerts::types::AggregateSummary {
                rule_id: "r".to_string(),
                group_key: "all".to_string(),
                event_count: 3,
                window_started: Utc::now(),
                elapsed_secs: 60.0,
                first_block: 1,
                last_block: 3,
                unique_senders: 1,
                unique_receivers: 1,
                summary: crate::alerts::types::SummaryValue::Count(3),
            },
            events: Vec::new(),
        };
        // Same rule, but the aggregated key "agg::r" is independent.
        assert!(f.should_pass(&aggregated, cooldown, now + Duration::from_secs(1)));
    }

    #[test]
    fn test_dedup_prune_keeps_newer_half() {
        let mut f = filter(Severity::Low);
        let now = Instant::now();
        for i in 0..9u8 {
            f.should_pass(&instant("r", Severity::High, i), Duration::ZERO, now);
        }
        // Cap is 8: the prune dropped the older half, so an early id may
        // fire again while a recent one stays suppressed.
        assert!(f.should_pass(&instant("r", Severity::High, 0), Duration::ZERO, now));
        assert!(!f.should_pass(&instant("r", Severity::High, 8), Duration::ZERO, now));
    }
}
