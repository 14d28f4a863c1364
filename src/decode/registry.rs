use alloy::primitives::B256;
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::events::EventCategory;

// Event vocabularies are kept in separate modules so identically-named
// events (the two Uniswap Swap layouts, the two Transfer layouts) each get
// their real signature hash.
mod erc20 {
    alloy::sol! {
        event Transfer(address indexed from, address indexed to, uint256 value);
        event Approval(address indexed owner, address indexed spender, uint256 value);
    }
}

mod erc721 {
    alloy::sol! {
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
    }
}

mod vault {
    alloy::sol! {
        event Deposit(address indexed user, uint256 amount);
        event Withdrawal(address indexed user, uint256 amount);
    }
}

mod univ2 {
    alloy::sol! {
        event Swap(
            address indexed sender,
            uint256 amount0In,
            uint256 amount1In,
            uint256 amount0Out,
            uint256 amount1Out,
            address indexed to
        );
    }
}

mod univ3 {
    alloy::sol! {
        event Swap(
            address indexed sender,
            address indexed recipient,
            int256 amount0,
            int256 amount1,
            uint160 sqrtPriceX96,
            uint128 liquidity,
            int24 tick
        );
    }
}

pub fn erc20_transfer_signature() -> B256 {
    erc20::Transfer::SIGNATURE_HASH
}

type DecodeFn = fn(&Log) -> Option<HashMap<String, JsonValue>>;

/// One candidate interpretation of a topic hash.
pub struct EventSpec {
    pub name: &'static str,
    pub category: EventCategory,
    pub decode: DecodeFn,
}

/// Maps topic hashes to candidate event interpretations. A hash may carry
/// several candidates (ERC-20 and ERC-721 Transfer share one signature but
/// differ in indexed-parameter count); candidates are tried in registration
/// order.
pub struct EventRegistry {
    entries: HashMap<B256, Vec<EventSpec>>,
}

impl EventRegistry {
    pub fn with_builtin_events() -> Self {
        let mut registry = Self {
            entries: HashMap::new(),
        };
        registry.register(
            erc20::Transfer::SIGNATURE_HASH,
            "Transfer",
            EventCategory::Transfer,
            decode_erc20_transfer,
        );
        registry.register(
            erc721::Transfer::SIGNATURE_HASH,
            "Transfer",
            EventCategory::Transfer,
            decode_erc721_transfer,
        );
        registry.register(
            erc20::Approval::SIGNATURE_HASH,
            "Approval",
            EventCategory::Approval,
            decode_approval,
        );
        registry.register(
            vault::Deposit::SIGNATURE_HASH,
            "Deposit",
            EventCategory::Deposit,
            decode_deposit,
        );
        registry.register(
            vault::Withdrawal::SIGNATURE_HASH,
            "Withdrawal",
            EventCategory::Withdrawal,
            decode_withdrawal,
        );
        registry.register(
            univ2::Swap::SIGNATURE_HASH,
            "Swap",
            EventCategory::Swap,
            decode_univ2_swap,
        );
        registry.register(
            univ3::Swap::SIGNATURE_HASH,
            "Swap",
            EventCategory::Swap,
            decode_univ3_swap,
        );
        registry
    }

    fn register(&mut self, topic: B256, name: &'static str, category: EventCategory, decode: DecodeFn) {
        self.entries.entry(topic).or_default().push(EventSpec {
            name,
            category,
            decode,
        });
    }

    pub fn candidates(&self, topic: &B256) -> &[EventSpec] {
        self.entries.get(topic).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Every registered topic hash whose candidates include the category.
    /// Used to derive watch-target topic sets from rule event types.
    pub fn signatures_for(&self, category: EventCategory) -> Vec<B256> {
        let mut sigs: Vec<B256> = self
            .entries
            .iter()
            .filter(|(_, specs)| specs.iter().any(|s| s.category == category))
            .map(|(topic, _)| *topic)
            .collect();
        sigs.sort();
        sigs
    }
}

fn hex_addr(addr: alloy::primitives::Address) -> JsonValue {
    JsonValue::String(format!("0x{}", hex::encode(addr)))
}

fn decode_erc20_transfer(log: &Log) -> Option<HashMap<String, JsonValue>> {
    // ERC-721 uses the same signature with the token id indexed; only accept
    // the three-topic layout here.
    if log.inner.data.topics().len() != 3 {
        return None;
    }
    let decoded = erc20::Transfer::decode_log(&log.inner).ok()?;
    let mut args = HashMap::new();
    args.insert("from".to_string(), hex_addr(decoded.from));
    args.insert("to".to_string(), hex_addr(decoded.to));
    args.insert(
        "value".to_string(),
        JsonValue::String(decoded.value.to_string()),
    );
    Some(args)
}

fn decode_erc721_transfer(log: &Log) -> Option<HashMap<String, JsonValue>> {
    if log.inner.data.topics().len() != 4 {
        return None;
    }
    let decoded = erc721::Transfer::decode_log(&log.inner).ok()?;
    let mut args = HashMap::new();
    args.insert("from".to_string(), hex_addr(decoded.from));
    args.insert("to".to_string(), hex_addr(decoded.to));
    args.insert(
        "token_id".to_string(),
        JsonValue::String(decoded.tokenId.to_string()),
    );
    Some(args)
}

fn decode_approval(log: &Log) -> Option<HashMap<String, JsonValue>> {
    let decoded = erc20::Approval::decode_log(&log.inner).ok()?;
    let mut args = HashMap::new();
    args.insert("owner".to_string(), hex_addr(decoded.owner));
    args.insert("spender".to_string(), hex_addr(decoded.spender));
    args.insert(
        "value".to_string(),
        JsonValue::String(decoded.value.to_string()),
    );
    Some(args)
}

fn decode_deposit(log: &Log) -> Option<HashMap<String, JsonValue>> {
    let decoded = vault::Deposit::decode_log(&log.inner).ok()?;
    let mut args = HashMap::new();
    args.insert("from".to_string(), hex_addr(decoded.user));
    args.insert(
        "amount".to_string(),
        JsonValue::String(decoded.amount.to_string()),
    );
    Some(args)
}

fn decode_withdrawal(log: &Log) -> Option<HashMap<String, JsonValue>> {
    let decoded = vault::Withdrawal::decode_log(&log.inner).ok()?;
    let mut args = HashMap::new();
    args.insert("from".to_string(), hex_addr(decoded.user));
    args.insert(
        "amount".to_string(),
        JsonValue::String(decoded.amount.to_string()),
    );
    Some(args)
}

fn decode_univ2_swap(log: &Log) -> Option<HashMap<String, JsonValue>> {
    let decoded = univ2::Swap::decode_log(&log.inner).ok()?;
    // Whichever amountN_in is non-zero is the paid side.
    let (amount_in, amount_out) = if decoded.amount0In > alloy::primitives::U256::ZERO {
        (decoded.amount0In, decoded.amount1Out)
    } else {
        (decoded.amount1In, decoded.amount0Out)
    };
    let mut args = HashMap::new();
    args.insert("sender".to_string(), hex_addr(decoded.sender));
    args.insert("recipient".to_string(), hex_addr(decoded.to));
    args.insert(
        "amount".to_string(),
        JsonValue::String(amount_in.to_string()),
    );
    args.insert(
        "amount_out".to_string(),
        JsonValue::String(amount_out.to_string()),
    );
    Some(args)
}

fn decode_univ3_swap(log: &Log) -> Option<HashMap<String, JsonValue>> {
    let decoded = univ3::Swap::decode_log(&log.inner).ok()?;
    // Positive amounts flow into the pool; the user paid that side.
    let (amount_in, amount_out) = if decoded.amount0.is_positive() {
        (decoded.amount0, -decoded.amount1)
    } else {
        (decoded.amount1, -decoded.amount0)
    };
    let mut args = HashMap::new();
    args.insert("sender".to_string(), hex_addr(decoded.sender));
    args.insert("recipient".to_string(), hex_addr(decoded.recipient));
    args.insert(
        "amount".to_string(),
        JsonValue::String(amount_in.to_string()),
    );
    args.insert(
        "amount_out".to_string(),
        JsonValue::String(amount_out.to_string()),
    );
    Some(args)
}
