use alloy::primitives::{Address, B256};
use std::sync::Arc;

use crate::decode::registry::EventRegistry;
use crate::events::EventCategory;

use super::loader::RuleStore;
use super::types::{Rule, RuleSet};

const ALL_CATEGORIES: [EventCategory; 5] = [
    EventCategory::Transfer,
    EventCategory::Approval,
    EventCategory::Deposit,
    EventCategory::Withdrawal,
    EventCategory::Swap,
];

/// What one rule asks the chain for: a set of topic0 hashes, optionally
/// pinned to a contract. `address: None` is a wildcard over all contracts.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub id: String,
    pub address: Option<Address>,
    pub topics: Vec<B256>,
}

/// Derive the watch targets the active rule set implies for one chain.
///
/// A rule pinned to another chain contributes nothing. A rule with a
/// contract allow-list yields one target per contract; an empty list yields
/// a single wildcard target. A type-agnostic rule watches every signature
/// the registry can decode.
pub fn derive_targets(rules: &RuleSet, registry: &EventRegistry, chain_id: u64) -> Vec<WatchTarget> {
    let mut targets = Vec::new();
    for rule in &rules.rules {
        if let Some(rule_chain) = rule.chain_id {
            if rule_chain != chain_id {
                continue;
            }
        }
        let topics = topics_for(rule, registry);
        if topics.is_empty() {
            continue;
        }

        if rule.contracts.is_empty() {
            targets.push(WatchTarget {
                id: rule.id.clone(),
                address: None,
                topics,
            });
        } else {
            for contract in &rule.contracts {
                // Addresses were validated at rule load.
                let Ok(address) = contract.parse::<Address>() else {
                    continue;
                };
                targets.push(WatchTarget {
                    id: rule.id.clone(),
                    address: Some(address),
                    topics: topics.clone(),
                });
            }
        }
    }
    targets
}

fn topics_for(rule: &Rule, registry: &EventRegistry) -> Vec<B256> {
    match &rule.event_type {
        Some(event_type) => EventCategory::parse(event_type)
            .map(|category| registry.signatures_for(category))
            .unwrap_or_default(),
        None => {
            let mut topics: Vec<B256> = ALL_CATEGORIES
                .iter()
                .flat_map(|c| registry.signatures_for(*c))
                .collect();
            topics.sort();
            topics.dedup();
            topics
        }
    }
}

/// Per-pipeline cache of derived targets, invalidated by the rule store's
/// generation counter so a hot reload takes effect on the next block.
pub struct WatchCache {
    chain_id: u64,
    generation: Option<u64>,
    targets: Vec<WatchTarget>,
}

impl WatchCache {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            generation: None,
            targets: Vec::new(),
        }
    }

    pub fn targets(&mut self, store: &Arc<RuleStore>, registry: &EventRegistry) -> &[WatchTarget] {
        let generation = store.generation();
        if self.generation != Some(generation) {
            self.targets = derive_targets(&store.current(), registry, self.chain_id);
            self.generation = Some(generation);
            tracing::debug!(
                chain_id = self.chain_id,
                generation,
                targets = self.targets.len(),
                "Watch targets rebuilt"
            );
        }
        &self.targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FinalityStatus;
    use crate::rules::types::Severity;

    fn rule(id: &str) -> Rule {
        Rule {
            id: id.to_string(),
            name: String::new(),
            enabled: true,
            chain_id: None,
            event_type: Some("transfer".to_string()),
            contracts: Vec::new(),
            conditions: Vec::new(),
            severity: Severity::Low,
            cooldown_secs: 0,
            min_finality: FinalityStatus::Pending,
            aggregation: None,
        }
    }

    #[test]
    fn test_chain_pinned_rule_excluded() {
        let registry = EventRegistry::with_builtin_events();
        let mut r = rule("eth-only");
        r.chain_id = Some(1);
        let set = RuleSet { rules: vec![r] };

        assert_eq!(derive_targets(&set, &registry, 1).len(), 1);
        assert!(derive_targets(&set, &registry, 137).is_empty());
    }

    #[test]
    fn test_contract_list_fans_out() {
        let registry = EventRegistry::with_builtin_events();
        let mut r = rule("two-tokens");
        r.contracts = vec![
            "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
            "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_string(),
        ];
        let set = RuleSet { rules: vec![r] };

        let targets = derive_targets(&set, &registry, 1);
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.address.is_some()));
        assert!(targets.iter().all(|t| t.id == "two-tokens"));
    }

    #[test]
    fn test_no_contracts_is_wildcard() {
        let registry = EventRegistry::with_builtin_events();
        let set = RuleSet {
            rules: vec![rule("anywhere")],
        };

        let targets = derive_targets(&set, &registry, 1);
        assert_eq!(targets.len(), 1);
        assert!(targets[0].address.is_none());
        assert!(!targets[0].topics.is_empty());
    }

    #[test]
    fn test_type_agnostic_rule_watches_everything() {
        let registry = EventRegistry::with_builtin_events();
        let mut r = rule("catch-all");
        r.event_type = None;
        let set = RuleSet { rules: vec![r] };

        let targets = derive_targets(&set, &registry, 1);
        let typed = registry.signatures_for(EventCategory::Transfer);
        assert!(targets[0].topics.len() > typed.len());
    }
}
