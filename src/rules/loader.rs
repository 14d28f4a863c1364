use bigdecimal::BigDecimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

use crate::events::EventCategory;

use super::types::{Condition, Rule, RuleSet};

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<toml::Value>,
}

/// Holds the active rule set and supports hot reload.
///
/// The set is swapped atomically: evaluation holds an `Arc` to one complete
/// generation, never a half-updated table. `generation()` lets consumers
/// (watch-target caches) detect swaps cheaply.
pub struct RuleStore {
    path: PathBuf,
    active: RwLock<Arc<RuleSet>>,
    generation: AtomicU64,
}

impl RuleStore {
    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let set = load_rule_file(&path)?;
        tracing::info!(rules = set.len(), path = %path.display(), "Rule set loaded");
        Ok(Self {
            path,
            active: RwLock::new(Arc::new(set)),
            generation: AtomicU64::new(0),
        })
    }

    pub fn current(&self) -> Arc<RuleSet> {
        self.active.read().expect("rule store poisoned").clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Re-read the rule file and swap the active set. Logs the id-level diff.
    /// A file that fails to parse outright leaves the previous set active.
    pub fn reload(&self) -> eyre::Result<()> {
        let next = load_rule_file(&self.path)?;

        let previous = self.current();
        let old_ids: HashSet<&str> = previous.rules.iter().map(|r| r.id.as_str()).collect();
        let new_ids: HashSet<&str> = next.rules.iter().map(|r| r.id.as_str()).collect();
        let added: Vec<String> = new_ids
            .difference(&old_ids)
            .map(|s| s.to_string())
            .collect();
        let removed: Vec<String> = old_ids
            .difference(&new_ids)
            .map(|s| s.to_string())
            .collect();

        *self.active.write().expect("rule store poisoned") = Arc::new(next);
        self.generation.fetch_add(1, Ordering::Release);

        tracing::info!(
            added = ?added,
            removed = ?removed,
            total = self.current().len(),
            "Rule set reloaded"
        );
        Ok(())
    }
}

/// Parse the rule file, validating each rule individually. An invalid rule is
/// rejected with a logged reason; the rest of the file still loads. Disabled
/// rules are skipped.
fn load_rule_file(path: &Path) -> eyre::Result<RuleSet> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("Failed to read rule file '{}': {}", path.display(), e))?;
    let file: RuleFile = toml::from_str(&content)
        .map_err(|e| eyre::eyre!("Failed to parse rule file '{}': {}", path.display(), e))?;

    let mut rules = Vec::new();
    let mut seen_ids = HashSet::new();

    for (index, value) in file.rules.into_iter().enumerate() {
        let rule: Rule = match value.try_into() {
            Ok(rule) => rule,
            Err(e) => {
                tracing::warn!(index, error = %e, "Rejecting malformed rule");
                continue;
            }
        };
        if !rule.enabled {
            tracing::debug!(rule = %rule.id, "Skipping disabled rule");
            continue;
        }
        if let Err(reason) = validate_rule(&rule) {
            tracing::warn!(rule = %rule.id, reason, "Rejecting invalid rule");
            continue;
        }
        if !seen_ids.insert(rule.id.clone()) {
            tracing::warn!(rule = %rule.id, "Rejecting duplicate rule id");
            continue;
        }
        rules.push(rule);
    }

    Ok(RuleSet { rules })
}

fn validate_rule(rule: &Rule) -> Result<(), String> {
    if rule.id.is_empty() {
        return Err("empty id".to_string());
    }
    if let Some(event_type) = &rule.event_type {
        if EventCategory::parse(event_type).is_none() {
            return Err(format!("unknown event type '{}'", event_type));
        }
    }
    for contract in &rule.contracts {
        if !contract.starts_with("0x") || contract.len() != 42 {
            return Err(format!("invalid contract address '{}'", contract));
        }
    }
    for cond in &rule.conditions {
        if let Condition::AmountCmp { value, .. } = cond {
            if BigDecimal::from_str(value).is_err() {
                return Err(format!("unparseable amount threshold '{}'", value));
            }
        }
    }
    if let Some(agg) = &rule.aggregation {
        if agg.window_secs < 1 {
            return Err("aggregation window below 1s".to_string());
        }
    }
    Ok(())
}

/// Background task: poll the rule file's mtime and reload on change.
pub async fn watch_rule_file(
    store: Arc<RuleStore>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut last_mtime = file_mtime(&store.path);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.cancelled() => break,
        }

        let mtime = file_mtime(&store.path);
        if mtime != last_mtime {
            last_mtime = mtime;
            if let Err(e) = store.reload() {
                tracing::warn!(error = %e, "Rule reload failed, keeping previous set");
            }
        }
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
