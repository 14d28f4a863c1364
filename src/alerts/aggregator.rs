use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::events::CanonicalEvent;
use crate::rules::types::{Rule, Severity, SummaryKind};

use super::types::{AggregateSummary, Alert, SummaryValue};

/// One open aggregation window. Exactly one exists per (rule, group key);
/// flushing removes it before a new window for the same key can be created.
struct AggregationWindow {
    rule_id: String,
    rule_name: String,
    severity: Severity,
    group_key: String,
    summary_kind: SummaryKind,
    events: Vec<CanonicalEvent>,
    started: Instant,
    started_at: DateTime<Utc>,
    flush_at: Instant,
}

/// Batches rule matches into time-windowed summaries.
///
/// Windows hold explicit monotonic deadlines; `flush_due` is driven by a
/// periodic sweep rather than per-window timers. Rules without an
/// aggregation spec produce instant alerts; critical/high rules emit an
/// instant alert per event even while a window is accumulating, so severity
/// escalation is never delayed by batching.
pub struct Aggregator {
    windows: HashMap<(String, String), AggregationWindow>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            windows: HashMap::new(),
        }
    }

    /// Route one rule match. Returns any alerts to emit immediately.
    pub fn process_match(&mut self, rule: &Rule, event: &CanonicalEvent, now: Instant) -> Vec<Alert> {
        let Some(spec) = &rule.aggregation else {
            return vec![Alert::Instant {
                rule_id: rule.id.clone(),
                rule_name: rule.display_name().to_string(),
                severity: rule.severity,
                event: event.clone(),
            }];
        };

        let group_key = group_key(&spec.group_by, event);
        let key = (rule.id.clone(), group_key.clone());

        let window = self.windows.entry(key).or_insert_with(|| {
            tracing::debug!(
                rule = %rule.id,
                group = %group_key,
                window_secs = spec.window_secs,
                "Opening aggregation window"
            );
            AggregationWindow {
                rule_id: rule.id.clone(),
                rule_name: rule.display_name().to_string(),
                severity: rule.severity,
                group_key,
                summary_kind: spec.summary,
                events: Vec::new(),
                started: now,
                started_at: Utc::now(),
                flush_at: now + Duration::from_secs(spec.window_secs),
            }
        });
        window.events.push(event.clone());

        // Severe matches escalate immediately even while aggregating.
        if rule.severity >= Severity::High {
            return vec![Alert::Instant {
                rule_id: rule.id.clone(),
                rule_name: rule.display_name().to_string(),
                severity: rule.severity,
                event: event.clone(),
            }];
        }
        Vec::new()
    }

    /// Flush every window whose deadline has passed.
    pub fn flush_due(&mut self, now: Instant) -> Vec<Alert> {
        let due: Vec<(String, String)> = self
            .windows
            .iter()
            .filter(|(_, w)| w.flush_at <= now)
            .map(|(k, _)| k.clone())
            .collect();

        due.into_iter()
            .filter_map(|key| self.windows.remove(&key))
            .map(|w| flush_window(w, now))
            .collect()
    }

    /// Flush everything regardless of deadline. Called on shutdown so no
    /// pending window is dropped.
    pub fn flush_all(&mut self) -> Vec<Alert> {
        let now = Instant::now();
        let keys: Vec<(String, String)> = self.windows.keys().cloned().collect();
        keys.into_iter()
            .filter_map(|key| self.windows.remove(&key))
            .map(|w| flush_window(w, now))
            .collect()
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }
}

/// Group key from the configured group-by fields: `contract` and `chain` are
/// event metadata, anything else an argument lookup. No fields ⇒ `"all"`.
fn group_key(group_by: &[String], event: &CanonicalEvent) -> String {
    if group_by.is_empty() {
        return "all".to_string();
    }
    group_by
        .iter()
        .map(|field| match field.as_str() {
            "contract" => format!("0x{}", hex::encode(event.contract)),
            "chain" => event.chain_id.to_string(),
            other => event
                .arg_str(other)
                .map(str::to_string)
                .unwrap_or_else(|| "unknown".to_string()),
        })
        .collect::<Vec<_>>()
        .join(":")
}

fn flush_window(window: AggregationWindow, now: Instant) -> Alert {
    let mut senders: HashSet<String> = HashSet::new();
    let mut receivers: HashSet<String> = HashSet::new();
    let mut first_block = u64::MAX;
    let mut last_block = 0u64;

    for event in &window.events {
        if let Some(from) = event.sender() {
            senders.insert(from.to_ascii_lowercase());
        }
        if let Some(to) = event.receiver() {
            receivers.insert(to.to_ascii_lowercase());
        }
        first_block = first_block.min(event.block_number);
        last_block = last_block.max(event.block_number);
    }

    let summary_value = match window.summary_kind {
        SummaryKind::Count => SummaryValue::Count(window.events.len()),
        SummaryKind::Total => {
            // Raw amounts are summed at arbitrary precision, then rendered.
            let total: BigDecimal = window
                .events
                .iter()
                .filter_map(|e| e.raw_amount())
                .sum();
            SummaryValue::Total(total.to_string())
        }
    };

    let summary = AggregateSummary {
        rule_id: window.rule_id.clone(),
        group_key: window.group_key.clone(),
        event_count: window.events.len(),
        window_started: window.started_at,
        elapsed_secs: now.saturating_duration_since(window.started).as_secs_f64(),
        first_block: if first_block == u64::MAX { 0 } else { first_block },
        last_block,
        unique_senders: senders.len(),
        unique_receivers: receivers.len(),
        summary: summary_value,
    };

    tracing::debug!(
        rule = %window.rule_id,
        group = %window.group_key,
        events = summary.event_count,
        "Flushing aggregation window"
    );

    Alert::Aggregated {
        rule_id: window.rule_id,
        rule_name: window.rule_name,
        severity: window.severity,
        summary,
        events: window.events,
    }
}
