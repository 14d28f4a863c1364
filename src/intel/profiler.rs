use alloy::primitives::Address;
use bigdecimal::ToPrimitive;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::broadcast;

use crate::config::ProfilerConfig;
use crate::events::{CanonicalEvent, EventCategory};
use crate::rules::types::Severity;

const PATTERN_CHANNEL_CAPACITY: usize = 256;

/// Behavioral pattern flagged on a wallet, carrying the triggering action's
/// chain coordinates.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub wallet: Address,
    pub chain_id: u64,
    pub block_number: u64,
    pub tx_hash: alloy::primitives::B256,
    pub kind: PatternKind,
    pub severity: Severity,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    HighVelocity,
    FlashMovement,
    WashTrading,
    LargeMovement,
    CrossContract,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighVelocity => "high_velocity",
            Self::FlashMovement => "flash_movement",
            Self::WashTrading => "wash_trading",
            Self::LargeMovement => "large_movement",
            Self::CrossContract => "cross_contract",
        }
    }

    /// Contribution to the wallet risk score per occurrence.
    fn weight(&self) -> u32 {
        match self {
            Self::WashTrading => 30,
            Self::FlashMovement => 25,
            Self::HighVelocity => 15,
            Self::LargeMovement => 10,
            Self::CrossContract => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Normal,
    Elevated,
    Suspicious,
    HighRisk,
}

impl RiskLevel {
    fn from_score(score: u32) -> Self {
        match score {
            0..=25 => Self::Normal,
            26..=50 => Self::Elevated,
            51..=75 => Self::Suspicious,
            _ => Self::HighRisk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ActionKind {
    Transfer,
    Deposit,
    Withdrawal,
    Swap,
}

struct WalletAction {
    kind: ActionKind,
    contract: Address,
    at: DateTime<Utc>,
}

/// Rolling behavioral state for one wallet.
struct WalletProfile {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    actions: VecDeque<WalletAction>,
    /// Raw amount history for the large-movement baseline.
    amounts: VecDeque<f64>,
    /// Actions per contract; the key set doubles as the touched-contract set.
    contract_actions: HashMap<Address, u64>,
    pattern_counts: HashMap<PatternKind, u32>,
    /// Contract combinations already reported for cross-contract activity.
    reported_contract_sets: HashSet<Vec<Address>>,
    total_actions: u64,
}

impl WalletProfile {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            first_seen: at,
            last_seen: at,
            actions: VecDeque::new(),
            amounts: VecDeque::new(),
            contract_actions: HashMap::new(),
            pattern_counts: HashMap::new(),
            reported_contract_sets: HashSet::new(),
            total_actions: 0,
        }
    }

    /// Actions whose timestamp falls within `window_secs` before `at`,
    /// inclusive of `at` itself.
    fn actions_within(&self, at: DateTime<Utc>, window_secs: u64) -> impl Iterator<Item = &WalletAction> {
        let cutoff = at - ChronoDuration::seconds(window_secs as i64);
        self.actions
            .iter()
            .filter(move |a| a.at >= cutoff && a.at <= at)
    }

    fn risk_score(&self) -> u32 {
        let mut score: u32 = self
            .pattern_counts
            .iter()
            .map(|(kind, count)| kind.weight().saturating_mul(*count))
            .sum();
        if self.total_actions > 20 {
            score += 10;
        }
        if self.total_actions > 50 {
            score += 10;
        }
        if self.contract_actions.len() >= 3 {
            score += 15;
        }
        if self.contract_actions.len() >= 5 {
            score += 10;
        }
        score.min(100)
    }
}

/// One row of the risk leaderboard.
#[derive(Debug, Clone, Serialize)]
pub struct WalletRisk {
    pub wallet: Address,
    pub score: u32,
    pub level: RiskLevel,
    pub total_actions: u64,
    pub contracts: usize,
    pub patterns: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Tracks per-wallet behavior across the event stream and surfaces
/// suspicious patterns: action bursts, deposit-then-withdraw flashes, wash
/// trading cycles, amounts far above the wallet's own baseline, and fanning
/// out across many contracts.
pub struct WalletProfiler {
    config: ProfilerConfig,
    profiles: HashMap<Address, WalletProfile>,
    pattern_log: VecDeque<Pattern>,
    tx: broadcast::Sender<Pattern>,
}

impl WalletProfiler {
    pub fn new(config: ProfilerConfig) -> Self {
        let (tx, _) = broadcast::channel(PATTERN_CHANNEL_CAPACITY);
        Self {
            config,
            profiles: HashMap::new(),
            pattern_log: VecDeque::new(),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Pattern> {
        self.tx.subscribe()
    }

    /// Fold one event into the initiating wallet's profile and run every
    /// detector. Returns the patterns this event triggered.
    pub fn observe(&mut self, event: &CanonicalEvent) -> Vec<Pattern> {
        if !self.config.enabled {
            return Vec::new();
        }
        let Some(kind) = action_kind(event.category) else {
            return Vec::new();
        };
        let Some(wallet) = event.sender().and_then(|s| s.parse::<Address>().ok()) else {
            return Vec::new();
        };
        let amount = event.raw_amount().and_then(|a| a.to_f64());

        let max_history = self.config.max_history;
        let profile = self
            .profiles
            .entry(wallet)
            .or_insert_with(|| WalletProfile::new(event.timestamp));
        profile.actions.push_back(WalletAction {
            kind,
            contract: event.contract,
            at: event.timestamp,
        });
        if profile.actions.len() > max_history {
            profile.actions.pop_front();
        }
        profile.last_seen = event.timestamp;
        *profile.contract_actions.entry(event.contract).or_insert(0) += 1;
        profile.total_actions += 1;

        let mut patterns = Vec::new();
        let at = event.timestamp;

        // Velocity: fires on the crossing action, not every action after.
        let burst = profile
            .actions_within(at, self.config.velocity_window_secs)
            .count();
        if burst == self.config.velocity_min_actions {
            patterns.push((
                PatternKind::HighVelocity,
                Severity::High,
                format!(
                    "{} actions within {}s",
                    burst, self.config.velocity_window_secs
                ),
            ));
        }

        // Flash movement: withdrawal shortly after a deposit.
        if kind == ActionKind::Withdrawal {
            let recent_deposit = profile
                .actions_within(at, self.config.flash_window_secs)
                .any(|a| a.kind == ActionKind::Deposit);
            if recent_deposit {
                patterns.push((
                    PatternKind::FlashMovement,
                    Severity::Critical,
                    format!(
                        "withdrawal within {}s of a deposit",
                        self.config.flash_window_secs
                    ),
                ));
            }
        }

        // Wash trading: deposit, swap and withdrawal all inside one window,
        // completed by the current action.
        if matches!(
            kind,
            ActionKind::Deposit | ActionKind::Swap | ActionKind::Withdrawal
        ) {
            let mut seen_kinds: HashSet<ActionKind> = HashSet::new();
            for action in profile.actions_within(at, self.config.wash_trade_window_secs) {
                seen_kinds.insert(action.kind);
            }
            if seen_kinds.contains(&ActionKind::Deposit)
                && seen_kinds.contains(&ActionKind::Swap)
                && seen_kinds.contains(&ActionKind::Withdrawal)
            {
                patterns.push((
                    PatternKind::WashTrading,
                    Severity::Critical,
                    format!(
                        "deposit, swap and withdrawal within {}s",
                        self.config.wash_trade_window_secs
                    ),
                ));
            }
        }

        // Large movement: amount dwarfs the wallet's own prior baseline.
        if let Some(amount) = amount {
            if profile.amounts.len() >= 3 {
                let avg = profile.amounts.iter().sum::<f64>() / profile.amounts.len() as f64;
                if avg > 0.0 && amount > avg * self.config.large_movement_multiplier {
                    patterns.push((
                        PatternKind::LargeMovement,
                        Severity::High,
                        format!("{:.1}x the wallet's average amount", amount / avg),
                    ));
                }
            }
            profile.amounts.push_back(amount);
            if profile.amounts.len() > max_history {
                profile.amounts.pop_front();
            }
        }

        // Cross-contract: fan-out across distinct contracts, reported once
        // per contract combination.
        if profile.contract_actions.len() >= 3 {
            let mut set: Vec<Address> = profile.contract_actions.keys().copied().collect();
            set.sort();
            if profile.reported_contract_sets.insert(set) {
                patterns.push((
                    PatternKind::CrossContract,
                    Severity::Medium,
                    format!("active across {} contracts", profile.contract_actions.len()),
                ));
            }
        }

        let out: Vec<Pattern> = patterns
            .into_iter()
            .map(|(kind, severity, detail)| {
                *profile.pattern_counts.entry(kind).or_insert(0) += 1;
                Pattern {
                    wallet,
                    chain_id: event.chain_id,
                    block_number: event.block_number,
                    tx_hash: event.tx_hash,
                    kind,
                    severity,
                    detail,
                    detected_at: at,
                }
            })
            .collect();

        for pattern in &out {
            tracing::info!(
                wallet = %pattern.wallet,
                chain_id = pattern.chain_id,
                block = pattern.block_number,
                tx = %pattern.tx_hash,
                pattern = pattern.kind.as_str(),
                severity = pattern.severity.as_str(),
                detail = %pattern.detail,
                "Wallet pattern detected"
            );
            self.pattern_log.push_back(pattern.clone());
            if self.pattern_log.len() > self.config.pattern_log_cap {
                self.pattern_log.pop_front();
            }
            let _ = self.tx.send(pattern.clone());
        }
        out
    }

    pub fn risk_score(&self, wallet: Address) -> Option<(u32, RiskLevel)> {
        self.profiles.get(&wallet).map(|p| {
            let score = p.risk_score();
            (score, RiskLevel::from_score(score))
        })
    }

    /// Highest-risk wallets first, capped at `limit`.
    pub fn risk_leaderboard(&self, limit: usize) -> Vec<WalletRisk> {
        let mut rows: Vec<WalletRisk> = self
            .profiles
            .iter()
            .map(|(wallet, profile)| {
                let score = profile.risk_score();
                WalletRisk {
                    wallet: *wallet,
                    score,
                    level: RiskLevel::from_score(score),
                    total_actions: profile.total_actions,
                    contracts: profile.contract_actions.len(),
                    patterns: profile.pattern_counts.values().sum(),
                    first_seen: profile.first_seen,
                    last_seen: profile.last_seen,
                }
            })
            .collect();
        rows.sort_by(|a, b| b.score.cmp(&a.score).then(a.wallet.cmp(&b.wallet)));
        rows.truncate(limit);
        rows
    }

    pub fn recent_patterns(&self, limit: usize) -> Vec<Pattern> {
        self.pattern_log
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn tracked_wallets(&self) -> usize {
        self.profiles.len()
    }
}

fn action_kind(category: EventCategory) -> Option<ActionKind> {
    match category {
        EventCategory::Transfer => Some(ActionKind::Transfer),
        EventCategory::Deposit => Some(ActionKind::Deposit),
        EventCategory::Withdrawal => Some(ActionKind::Withdrawal),
        EventCategory::Swap => Some(ActionKind::Swap),
        EventCategory::Approval => None,
    }
}
