use alloy::primitives::Address;
use bigdecimal::ToPrimitive;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

use crate::config::AnomalyConfig;
use crate::events::CanonicalEvent;
use crate::rules::types::Severity;

/// Statistical outlier detection over per-asset amount streams.
///
/// Each (chain, contract) pair keeps a bounded ring of normalized amounts.
/// An incoming amount is scored against the rolling mean and standard
/// deviation of the samples that preceded it, then joins the ring itself.
pub struct AnomalyDetector {
    config: AnomalyConfig,
    assets: HashMap<(u64, Address), AssetSeries>,
}

struct AssetSeries {
    samples: VecDeque<f64>,
}

/// Verdict for an amount flagged as an outlier.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyVerdict {
    pub chain_id: u64,
    pub asset: Address,
    pub amount: f64,
    pub z_score: f64,
    pub severity: Severity,
    /// Rough probability that the amount is genuinely unusual, derived
    /// from the normal-distribution band the z-score falls in.
    pub confidence: &'static str,
    pub mean: f64,
    pub std_dev: f64,
    pub sample_count: usize,
}

/// Point-in-time baseline for one tracked asset.
#[derive(Debug, Clone, Serialize)]
pub struct AssetStats {
    pub chain_id: u64,
    pub asset: Address,
    pub sample_count: usize,
    pub mean: f64,
    pub std_dev: f64,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            assets: HashMap::new(),
        }
    }

    /// Score an event's amount against its asset baseline. Returns a verdict
    /// only when the amount is at least a medium-band outlier; the amount is
    /// always recorded as a sample afterwards.
    pub fn observe(&mut self, event: &CanonicalEvent) -> Option<AnomalyVerdict> {
        if !self.config.enabled {
            return None;
        }
        let raw = event.raw_amount()?;
        let decimals = self.decimals_for(event.contract);
        let amount = raw.to_f64()? / 10f64.powi(decimals as i32);
        if !amount.is_finite() {
            return None;
        }

        let series = self
            .assets
            .entry((event.chain_id, event.contract))
            .or_insert_with(|| AssetSeries {
                samples: VecDeque::new(),
            });

        // Score against the samples that came before this one.
        let verdict = if series.samples.len() >= self.config.min_samples {
            let (mean, std_dev) = window_stats(&series.samples, self.config.stats_window);
            if std_dev > 0.0 {
                let z = (amount - mean) / std_dev;
                severity_for(z.abs()).map(|severity| AnomalyVerdict {
                    chain_id: event.chain_id,
                    asset: event.contract,
                    amount,
                    z_score: z,
                    severity,
                    confidence: confidence_for(z.abs()),
                    mean,
                    std_dev,
                    sample_count: series.samples.len(),
                })
            } else {
                None
            }
        } else {
            None
        };

        series.samples.push_back(amount);
        if series.samples.len() > self.config.max_samples {
            series.samples.pop_front();
        }

        if let Some(v) = &verdict {
            tracing::debug!(
                asset = %v.asset,
                chain_id = v.chain_id,
                z_score = v.z_score,
                severity = v.severity.as_str(),
                "Amount outlier detected"
            );
        }
        verdict
    }

    fn decimals_for(&self, contract: Address) -> u8 {
        let key = format!("0x{}", hex::encode(contract));
        self.config
            .decimals_overrides
            .get(&key)
            .copied()
            .unwrap_or(self.config.default_decimals)
    }

    pub fn asset_stats(&self) -> Vec<AssetStats> {
        let mut stats: Vec<AssetStats> = self
            .assets
            .iter()
            .map(|((chain_id, asset), series)| {
                let (mean, std_dev) = window_stats(&series.samples, self.config.stats_window);
                AssetStats {
                    chain_id: *chain_id,
                    asset: *asset,
                    sample_count: series.samples.len(),
                    mean,
                    std_dev,
                }
            })
            .collect();
        stats.sort_by(|a, b| (a.chain_id, a.asset).cmp(&(b.chain_id, b.asset)));
        stats
    }
}

/// Mean and population standard deviation over the most recent `window`
/// samples.
fn window_stats(samples: &VecDeque<f64>, window: usize) -> (f64, f64) {
    let start = samples.len().saturating_sub(window);
    let recent: Vec<f64> = samples.iter().skip(start).copied().collect();
    if recent.is_empty() {
        return (0.0, 0.0);
    }
    let n = recent.len() as f64;
    let mean = recent.iter().sum::<f64>() / n;
    let variance = recent.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

fn severity_for(z: f64) -> Option<Severity> {
    if z >= 3.0 {
        Some(Severity::Critical)
    } else if z >= 2.0 {
        Some(Severity::High)
    } else if z >= 1.5 {
        Some(Severity::Medium)
    } else {
        None
    }
}

fn confidence_for(z: f64) -> &'static str {
    if z >= 3.0 {
        "99.7%"
    } else if z >= 2.5 {
        "98.8%"
    } else if z >= 2.0 {
        "95.4%"
    } else if z >= 1.5 {
        "86.6%"
    } else {
        "<85%"
    }
}
