use alloy::providers::{Provider, RootProvider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub type HttpProvider = RootProvider;

/// One upstream endpoint with its health bookkeeping. Mutated only by the
/// pool, on call outcome or health check.
struct ProviderEntry {
    url: String,
    provider: Arc<HttpProvider>,
    healthy: bool,
    last_latency: Option<Duration>,
    consecutive_errors: u32,
}

/// Connection pool over a chain's configured endpoints. Calls round-robin
/// across healthy entries and fail over until every provider has been tried
/// once.
pub struct RpcPool {
    chain: String,
    entries: Mutex<Vec<ProviderEntry>>,
    cursor: AtomicUsize,
    max_consecutive_errors: u32,
}

impl RpcPool {
    pub fn new(chain: &str, endpoints: &[String], max_consecutive_errors: u32) -> eyre::Result<Self> {
        let mut entries = Vec::with_capacity(endpoints.len());
        for url in endpoints {
            let parsed = url
                .parse()
                .map_err(|e| eyre::eyre!("Invalid RPC URL '{}': {}", url, e))?;
            entries.push(ProviderEntry {
                url: url.clone(),
                provider: Arc::new(RootProvider::new_http(parsed)),
                healthy: true,
                last_latency: None,
                consecutive_errors: 0,
            });
        }
        if entries.is_empty() {
            return Err(eyre::eyre!("Chain '{}' has no RPC endpoints", chain));
        }
        Ok(Self {
            chain: chain.to_string(),
            entries: Mutex::new(entries),
            cursor: AtomicUsize::new(0),
            max_consecutive_errors,
        })
    }

    /// Next healthy provider, round-robin. If every entry is unhealthy, all
    /// are reset to healthy and the first is returned — the pool never
    /// refuses to yield a provider.
    pub fn provider(&self) -> (usize, Arc<HttpProvider>) {
        let mut entries = self.entries.lock().expect("provider pool poisoned");
        let n = entries.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..n {
            let idx = (start + offset) % n;
            if entries[idx].healthy {
                return (idx, entries[idx].provider.clone());
            }
        }

        tracing::warn!(
            chain = %self.chain,
            providers = n,
            "All providers unhealthy, resetting pool"
        );
        for entry in entries.iter_mut() {
            entry.healthy = true;
            entry.consecutive_errors = 0;
        }
        (0, entries[0].provider.clone())
    }

    fn mark_ok(&self, idx: usize, latency: Duration) {
        let mut entries = self.entries.lock().expect("provider pool poisoned");
        if let Some(entry) = entries.get_mut(idx) {
            entry.healthy = true;
            entry.consecutive_errors = 0;
            entry.last_latency = Some(latency);
        }
    }

    fn mark_failed(&self, idx: usize, error: &str) {
        let mut entries = self.entries.lock().expect("provider pool poisoned");
        let chain = self.chain.clone();
        if let Some(entry) = entries.get_mut(idx) {
            entry.consecutive_errors += 1;
            if entry.consecutive_errors >= self.max_consecutive_errors {
                entry.healthy = false;
            }
            if is_transient(error) {
                tracing::debug!(
                    chain = %chain,
                    endpoint = %entry.url,
                    errors = entry.consecutive_errors,
                    error,
                    "Transient RPC failure"
                );
            } else {
                tracing::warn!(
                    chain = %chain,
                    endpoint = %entry.url,
                    errors = entry.consecutive_errors,
                    healthy = entry.healthy,
                    error,
                    "RPC call failed"
                );
            }
        }
    }

    /// Failover ordering: healthy entries in round-robin order first, then
    /// the unhealthy ones as a last resort.
    fn failover_order(&self) -> Vec<(usize, Arc<HttpProvider>)> {
        let entries = self.entries.lock().expect("provider pool poisoned");
        let n = entries.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);

        let mut order = Vec::with_capacity(n);
        for offset in 0..n {
            let idx = (start + offset) % n;
            if entries[idx].healthy {
                order.push((idx, entries[idx].provider.clone()));
            }
        }
        for offset in 0..n {
            let idx = (start + offset) % n;
            if !entries[idx].healthy {
                order.push((idx, entries[idx].provider.clone()));
            }
        }
        order
    }

    /// Run `f` against a provider, failing over to the next distinct provider
    /// on error until each has been tried once. Errors from every attempt are
    /// aggregated into the final error.
    pub async fn call_with_failover<T, E, F, Fut>(&self, op: &str, f: F) -> eyre::Result<T>
    where
        F: Fn(Arc<HttpProvider>) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let order = self.failover_order();
        let attempts = order.len();
        let mut failures = Vec::new();

        for (idx, provider) in order {
            let started = Instant::now();
            match f(provider).await {
                Ok(val) => {
                    self.mark_ok(idx, started.elapsed());
                    return Ok(val);
                }
                Err(e) => {
                    let msg = e.to_string();
                    self.mark_failed(idx, &msg);
                    failures.push(msg);
                }
            }
        }

        Err(eyre::eyre!(
            "RPC '{}' failed on all {} providers for chain '{}': {}",
            op,
            attempts,
            self.chain,
            failures.join("; ")
        ))
    }

    /// Re-probe every entry with a lightweight call and restore recovered
    /// providers.
    pub async fn health_check(&self) {
        let probes: Vec<(usize, Arc<HttpProvider>, String)> = {
            let entries = self.entries.lock().expect("provider pool poisoned");
            entries
                .iter()
                .enumerate()
                .map(|(i, e)| (i, e.provider.clone(), e.url.clone()))
                .collect()
        };

        for (idx, provider, url) in probes {
            let started = Instant::now();
            match provider.get_block_number().await {
                Ok(_) => self.mark_ok(idx, started.elapsed()),
                Err(e) => {
                    tracing::debug!(
                        chain = %self.chain,
                        endpoint = %url,
                        error = %e,
                        "Health probe failed"
                    );
                    self.mark_failed(idx, &e.to_string());
                }
            }
        }

        let (healthy, total) = self.stats();
        if healthy < total {
            tracing::warn!(
                chain = %self.chain,
                healthy,
                total,
                "Provider pool degraded"
            );
        }
    }

    /// (healthy, total) provider counts for the stats surface.
    pub fn stats(&self) -> (usize, usize) {
        let entries = self.entries.lock().expect("provider pool poisoned");
        let healthy = entries.iter().filter(|e| e.healthy).count();
        (healthy, entries.len())
    }

    #[cfg(test)]
    fn force_failure(&self, idx: usize, times: u32) {
        for _ in 0..times {
            self.mark_failed(idx, "connection refused");
        }
    }
}

/// Timeouts, resets, and rate limiting recover on their own; anything else
/// deserves a louder log line.
fn is_transient(error: &str) -> bool {
    let lower = error.to_ascii_lowercase();
    lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("reset")
        || lower.contains("429")
        || lower.contains("rate limit")
}

/// Background task: periodic health probes until shutdown.
pub async fn run_health_checks(
    pool: Arc<RpcPool>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => break,
        }
        pool.health_check().await;
    }
}
