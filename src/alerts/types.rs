use chrono::{DateTime, Utc};

use crate::events::CanonicalEvent;
use crate::rules::types::Severity;

/// Rendered summary of one flushed aggregation window.
#[derive(Debug, Clone)]
pub struct AggregateSummary {
    pub rule_id: String,
    pub group_key: String,
    pub event_count: usize,
    pub window_started: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub first_block: u64,
    pub last_block: u64,
    pub unique_senders: usize,
    pub unique_receivers: usize,
    pub summary: SummaryValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SummaryValue {
    /// Sum of raw amounts, rendered as a decimal string.
    Total(String),
    Count(usize),
}

/// A candidate alert for the external sink. Instant alerts carry the single
/// triggering event; aggregated alerts carry the window summary plus its
/// member events.
#[derive(Debug, Clone)]
pub enum Alert {
    Instant {
        rule_id: String,
        rule_name: String,
        severity: Severity,
        event: CanonicalEvent,
    },
    Aggregated {
        rule_id: String,
        rule_name: String,
        severity: Severity,
        summary: AggregateSummary,
        events: Vec<CanonicalEvent>,
    },
}

impl Alert {
    pub fn rule_id(&self) -> &str {
        match self {
            Self::Instant { rule_id, .. } | Self::Aggregated { rule_id, .. } => rule_id,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Instant { severity, .. } | Self::Aggregated { severity, .. } => *severity,
        }
    }

    /// Key used for cooldown bookkeeping: aggregated alerts cool down
    /// independently of instant ones for the same rule.
    pub fn cooldown_key(&self) -> String {
        match self {
            Self::Instant { rule_id, .. } => rule_id.clone(),
            Self::Aggregated { rule_id, .. } => format!("agg::{}", rule_id),
        }
    }
}
