use alloy::primitives::{Address, B256};
use alloy::providers::Provider;
use alloy::rpc::types::{Filter, Log};
use std::collections::BTreeSet;

use crate::rpc::pool::RpcPool;
use crate::rules::watch::WatchTarget;

/// Build one minimal log filter covering every watch target in a block range.
///
/// The topic0 set is the union of all target signatures. The address
/// constraint is applied only when no target is a wildcard: one superset
/// query is cheaper than a per-target fan-out, and a wildcard target makes
/// any address constraint incorrect.
///
/// Returns `None` when there are no targets — nothing is watched, so nothing
/// is fetched.
pub fn build_filter(targets: &[WatchTarget], from_block: u64, to_block: u64) -> Option<Filter> {
    if targets.is_empty() {
        return None;
    }

    let mut topics: BTreeSet<B256> = BTreeSet::new();
    let mut addresses: BTreeSet<Address> = BTreeSet::new();
    let mut has_wildcard = false;

    for target in targets {
        topics.extend(target.topics.iter().copied());
        match target.address {
            Some(addr) => {
                addresses.insert(addr);
            }
            None => has_wildcard = true,
        }
    }

    let mut filter = Filter::new()
        .from_block(from_block)
        .to_block(to_block)
        .event_signature(topics.into_iter().collect::<Vec<_>>());

    if !has_wildcard {
        filter = filter.address(addresses.into_iter().collect::<Vec<_>>());
    }

    Some(filter)
}

/// Fetch the logs the active watch targets care about for one block range.
pub async fn fetch_logs(
    pool: &RpcPool,
    targets: &[WatchTarget],
    from_block: u64,
    to_block: u64,
) -> eyre::Result<Vec<Log>> {
    let Some(filter) = build_filter(targets, from_block, to_block) else {
        return Ok(Vec::new());
    };

    pool.call_with_failover("eth_getLogs", |p| {
        let filter = filter.clone();
        async move { p.get_logs(&filter).await }
    })
    .await
}
