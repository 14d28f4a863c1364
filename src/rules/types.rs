use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::events::FinalityStatus;

/// Alert severity. Ordinal: low < medium < high < critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Comparison operators for amount and numeric conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

/// One node of a rule's condition tree. Tagged by `kind` in the rule file;
/// an unknown kind fails deserialization and rejects the rule at load time.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Case-insensitive address equality against an argument field.
    AddressEq { field: String, value: String },
    /// Case-insensitive address membership.
    AddressIn { field: String, values: Vec<String> },
    /// Arbitrary-precision comparison of a raw token amount. `value` is a
    /// decimal string so thresholds above 2^64 survive the TOML round-trip.
    AmountCmp {
        field: String,
        op: CmpOp,
        value: String,
    },
    /// Floating-point comparison for plain numeric fields.
    NumberCmp { field: String, op: CmpOp, value: f64 },
    /// Exact match on any argument value.
    Exact { field: String, value: JsonValue },
}

/// How an aggregation window summarizes its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryKind {
    Total,
    Count,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationSpec {
    pub window_secs: u64,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default = "default_summary")]
    pub summary: SummaryKind,
}

fn default_summary() -> SummaryKind {
    SummaryKind::Count
}

/// A declarative alerting rule, loaded from the rule config store.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Restrict to one chain id; absent = chain-agnostic.
    pub chain_id: Option<u64>,
    /// Event category this rule applies to; absent = type-agnostic.
    pub event_type: Option<String>,
    /// Contract allow-list (0x-hex); empty = any contract.
    #[serde(default)]
    pub contracts: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub severity: Severity,
    #[serde(default)]
    pub cooldown_secs: u64,
    #[serde(default = "default_min_finality")]
    pub min_finality: FinalityStatus,
    pub aggregation: Option<AggregationSpec>,
}

fn default_enabled() -> bool {
    true
}

fn default_min_finality() -> FinalityStatus {
    FinalityStatus::Pending
}

impl Rule {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// The active rule set. Replaced wholesale on reload.
#[derive(Debug, Default)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_condition_tagged_parse() {
        let toml_str = r#"
kind = "amount_cmp"
field = "value"
op = "gte"
value = "1000000000000000000000000"
"#;
        let cond: Condition = toml::from_str(toml_str).unwrap();
        assert!(matches!(
            cond,
            Condition::AmountCmp {
                op: CmpOp::Gte,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_condition_kind_rejected() {
        let toml_str = r#"
kind = "regex_match"
field = "value"
pattern = ".*"
"#;
        assert!(toml::from_str::<Condition>(toml_str).is_err());
    }
}
