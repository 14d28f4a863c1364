pub mod registry;

use alloy::primitives::{Address, U256};
use alloy::rpc::types::Log;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::events::{event_id, CanonicalEvent, EventCategory, FinalityStatus};
use registry::{erc20_transfer_signature, EventRegistry};

/// Decodes raw logs into canonical events.
///
/// Candidates registered for a topic hash are tried in registration order;
/// the first that parses wins. Logs matching no candidate fall through to a
/// manual transfer heuristic for legacy non-conforming encodings, and are
/// otherwise dropped — anything unrecognized was either never requested by a
/// watch target or has a shape we cannot attribute, and selective indexing
/// means discarding it is correct.
pub struct EventDecoder {
    registry: EventRegistry,
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDecoder {
    pub fn new() -> Self {
        Self {
            registry: EventRegistry::with_builtin_events(),
        }
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub fn decode(
        &self,
        chain_id: u64,
        log: &Log,
        finality: FinalityStatus,
        timestamp: DateTime<Utc>,
    ) -> Option<CanonicalEvent> {
        let topics = log.inner.data.topics();
        if topics.is_empty() {
            return None;
        }

        // A log without block coordinates cannot be given a canonical id.
        let block_hash = log.block_hash?;
        let block_number = log.block_number?;
        let tx_hash = log.transaction_hash?;
        let log_index = log.log_index.unwrap_or(0);

        let decoded = self
            .registry
            .candidates(&topics[0])
            .iter()
            .find_map(|spec| (spec.decode)(log).map(|args| (spec.name, spec.category, args)))
            .or_else(|| fallback_transfer(log));

        let (name, category, args) = match decoded {
            Some(d) => d,
            None => {
                tracing::debug!(
                    contract = %log.inner.address,
                    topic0 = %topics[0],
                    "Dropping log with unrecognized shape"
                );
                return None;
            }
        };

        Some(CanonicalEvent {
            id: event_id(chain_id, block_hash, tx_hash, log_index),
            chain_id,
            block_number,
            block_hash,
            tx_hash,
            log_index,
            contract: log.inner.address,
            name: name.to_string(),
            category,
            args,
            finality,
            confirmations: 0,
            timestamp,
        })
    }
}

/// Manual decode for transfer-shaped logs that no registered interface
/// parses: legacy tokens that index only the sender, or emit malformed data
/// alongside the standard topic layout.
fn fallback_transfer(
    log: &Log,
) -> Option<(&'static str, EventCategory, HashMap<String, JsonValue>)> {
    let topics = log.inner.data.topics();
    if topics[0] != erc20_transfer_signature() {
        return None;
    }
    let data = log.inner.data.data.as_ref();

    let (from, to, value) = match topics.len() {
        // Standard topic layout but non-standard data (empty or short).
        3 => {
            let from = Address::from_word(topics[1]);
            let to = Address::from_word(topics[2]);
            let value = data_word(data, 0).unwrap_or(U256::ZERO);
            (from, to, value)
        }
        // Only the sender indexed; receiver and value live in the data.
        2 => {
            let from = Address::from_word(topics[1]);
            let to = Address::from_word(data_word(data, 0)?.into());
            let value = data_word(data, 1).unwrap_or(U256::ZERO);
            (from, to, value)
        }
        _ => return None,
    };

    let mut args = HashMap::new();
    args.insert(
        "from".to_string(),
        JsonValue::String(format!("0x{}", hex::encode(from))),
    );
    args.insert(
        "to".to_string(),
        JsonValue::String(format!("0x{}", hex::encode(to))),
    );
    args.insert("value".to_string(), JsonValue::String(value.to_string()));

    Some(("Transfer", EventCategory::Transfer, args))
}

fn data_word(data: &[u8], index: usize) -> Option<U256> {
    let start = index * 32;
    let end = start + 32;
    if data.len() < end {
        return None;
    }
    Some(U256::from_be_slice(&data[start..end]))
}

#[cfg(test)]
pub(crate) mod test_support {
    use alloy::primitives::{Address, Bytes, LogData, B256};
    use alloy::rpc::types::Log;

    /// Build a synthetic RPC log for decoder and pipeline tests.
    pub fn make_log(
        address: Address,
        topics: Vec<B256>,
        data: Vec<u8>,
        block_number: u64,
        block_hash: B256,
        tx_hash: B256,
        log_index: u64,
    ) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address,
                data: LogData::new_unchecked(topics, Bytes::from(data)),
            },
            block_hash: Some(block_hash),
            block_number: Some(block_number),
            block_timestamp: None,
            transaction_hash: Some(tx_hash),
            transaction_index: Some(0),
            log_index: Some(log_index),
            removed: false,
        }
    }

    pub fn word_from_address(addr: Address) -> B256 {
        addr.into_word()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use alloy::primitives::{B256, U256};

    fn transfer_log(value: U256, topics: usize) -> Log {
        let from = Address::repeat_byte(0x11);
        let to = Address::repeat_byte(0x22);
        let sig = erc20_transfer_signature();
        let (topics, data) = match topics {
            3 => (
                vec![sig, word_from_address(from), word_from_address(to)],
                value.to_be_bytes::<32>().to_vec(),
            ),
            2 => {
                let mut data = word_from_address(to).as_slice().to_vec();
                data.extend_from_slice(&value.to_be_bytes::<32>());
                (vec![sig, word_from_address(from)], data)
            }
            _ => panic!("unsupported shape"),
        };
        make_log(
            Address::repeat_byte(0xcc),
            topics,
            data,
            100,
            B256::repeat_byte(0x01),
            B256::repeat_byte(0xaa),
            3,
        )
    }

    #[test]
    fn test_decode_standard_transfer() {
        let decoder = EventDecoder::new();
        let log = transfer_log(U256::from(1_000_000u64), 3);

        let event = decoder
            .decode(1, &log, FinalityStatus::Pending, Utc::now())
            .unwrap();
        assert_eq!(event.category, EventCategory::Transfer);
        assert_eq!(event.name, "Transfer");
        assert_eq!(event.arg_str("value"), Some("1000000"));
        assert_eq!(
            event.arg_str("from"),
            Some("0x1111111111111111111111111111111111111111")
        );
        assert_eq!(event.confirmations, 0);
        assert_eq!(event.finality, FinalityStatus::Pending);
    }

    #[test]
    fn test_decode_legacy_two_topic_transfer() {
        let decoder = EventDecoder::new();
        let log = transfer_log(U256::from(42u64), 2);

        let event = decoder
            .decode(1, &log, FinalityStatus::Pending, Utc::now())
            .unwrap();
        assert_eq!(event.category, EventCategory::Transfer);
        assert_eq!(event.arg_str("value"), Some("42"));
        assert_eq!(
            event.arg_str("to"),
            Some("0x2222222222222222222222222222222222222222")
        );
    }

    #[test]
    fn test_unknown_topic_dropped() {
        let decoder = EventDecoder::new();
        let log = make_log(
            Address::repeat_byte(0xcc),
            vec![B256::repeat_byte(0xff)],
            vec![],
            100,
            B256::repeat_byte(0x01),
            B256::repeat_byte(0xaa),
            0,
        );
        assert!(decoder
            .decode(1, &log, FinalityStatus::Pending, Utc::now())
            .is_none());
    }

    #[test]
    fn test_event_ids_differ_per_block_hash() {
        let decoder = EventDecoder::new();
        let mut log_a = transfer_log(U256::from(7u64), 3);
        let mut log_b = log_a.clone();
        log_a.block_hash = Some(B256::repeat_byte(0x01));
        log_b.block_hash = Some(B256::repeat_byte(0x02));

        let ev_a = decoder
            .decode(1, &log_a, FinalityStatus::Pending, Utc::now())
            .unwrap();
        let ev_b = decoder
            .decode(1, &log_b, FinalityStatus::Pending, Utc::now())
            .unwrap();
        assert_ne!(ev_a.id, ev_b.id);
    }
}
