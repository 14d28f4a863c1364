use bigdecimal::BigDecimal;
use serde_json::Value as JsonValue;
use std::str::FromStr;

use crate::events::{CanonicalEvent, FinalityStatus};

use super::types::{CmpOp, Condition, Rule};

/// Does an event satisfy a rule? Every gate must pass: chain, event type,
/// contract allow-list, minimum finality, and the full condition tree.
pub fn matches(rule: &Rule, event: &CanonicalEvent) -> bool {
    if let Some(chain_id) = rule.chain_id {
        if chain_id != event.chain_id {
            return false;
        }
    }

    if let Some(event_type) = &rule.event_type {
        if event.category.as_str() != event_type {
            return false;
        }
    }

    if !rule.contracts.is_empty() {
        let contract = format!("0x{}", hex::encode(event.contract));
        if !rule
            .contracts
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&contract))
        {
            return false;
        }
    }

    // Reverted events never satisfy a rule; otherwise ordinal comparison.
    if event.finality == FinalityStatus::Reverted || event.finality < rule.min_finality {
        return false;
    }

    rule.conditions.iter().all(|cond| check(cond, event))
}

/// Evaluate one condition. Anything that cannot be resolved — missing field,
/// unparseable value — fails the condition (fail-closed).
fn check(cond: &Condition, event: &CanonicalEvent) -> bool {
    match cond {
        Condition::AddressEq { field, value } => lookup_str(event, field)
            .map(|actual| actual.eq_ignore_ascii_case(value))
            .unwrap_or(false),
        Condition::AddressIn { field, values } => lookup_str(event, field)
            .map(|actual| values.iter().any(|v| v.eq_ignore_ascii_case(&actual)))
            .unwrap_or(false),
        Condition::AmountCmp { field, op, value } => {
            let Some(actual) = lookup_amount(event, field) else {
                return false;
            };
            let Ok(threshold) = BigDecimal::from_str(value) else {
                return false;
            };
            compare(*op, &actual, &threshold)
        }
        Condition::NumberCmp { field, op, value } => {
            let Some(actual) = lookup_number(event, field) else {
                return false;
            };
            compare(*op, &actual, value)
        }
        Condition::Exact { field, value } => lookup(event, field)
            .map(|actual| actual == value)
            .unwrap_or(false),
    }
}

fn compare<T: PartialOrd>(op: CmpOp, actual: &T, threshold: &T) -> bool {
    match op {
        CmpOp::Gt => actual > threshold,
        CmpOp::Gte => actual >= threshold,
        CmpOp::Lt => actual < threshold,
        CmpOp::Lte => actual <= threshold,
        CmpOp::Eq => actual == threshold,
    }
}

/// Field lookup. `contract` and `chain` address event metadata; anything
/// else is an argument name.
fn lookup<'a>(event: &'a CanonicalEvent, field: &str) -> Option<FieldValue<'a>> {
    match field {
        "contract" => Some(FieldValue::Owned(JsonValue::String(format!(
            "0x{}",
            hex::encode(event.contract)
        )))),
        "chain" => Some(FieldValue::Owned(JsonValue::from(event.chain_id))),
        _ => event.args.get(field).map(FieldValue::Borrowed),
    }
}

/// A looked-up field value, possibly synthesized from event metadata.
enum FieldValue<'a> {
    Borrowed(&'a JsonValue),
    Owned(JsonValue),
}

impl PartialEq<&JsonValue> for FieldValue<'_> {
    fn eq(&self, other: &&JsonValue) -> bool {
        match self {
            Self::Borrowed(v) => *v == *other,
            Self::Owned(v) => v == *other,
        }
    }
}

impl FieldValue<'_> {
    fn as_value(&self) -> &JsonValue {
        match self {
            Self::Borrowed(v) => v,
            Self::Owned(v) => v,
        }
    }
}

fn lookup_str(event: &CanonicalEvent, field: &str) -> Option<String> {
    lookup(event, field).and_then(|v| v.as_value().as_str().map(str::to_string))
}

fn lookup_amount(event: &CanonicalEvent, field: &str) -> Option<BigDecimal> {
    let value = lookup(event, field)?;
    match value.as_value() {
        JsonValue::String(s) => BigDecimal::from_str(s).ok(),
        JsonValue::Number(n) => BigDecimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

fn lookup_number(event: &CanonicalEvent, field: &str) -> Option<f64> {
    let value = lookup(event, field)?;
    match value.as_value() {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    }
}
