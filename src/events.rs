//! Typed event model.
//!
//! Raw records arrive in three shapes (file records with positional `args`, RPC [`Log`]s and
//! indexer transfer rows). All of them are normalised into [`ChainEvent`], whose `kind` is the
//! semantic classification and whose `args` carry the kind-specific payload.

use ethers::types::{Address, Log, H256, U256};
use ethers::utils::format_units;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;
use crate::settings::ChainConfig;
use crate::utils::deserialize_lenient_u64;

/// Canonical zero address used as the mint source and burn sink.
pub const VOID_ADDRESS: Address = Address::zero();

/// Decimals used when rendering raw token amounts.
pub const TOKEN_DECIMALS: u32 = 18;

const TRANSFER_ARITY: usize = 3;
const BRIDGE_ARITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Unknown,
    Mint,
    Transfer,
    Burn,
    BridgeStart,
    BridgeEnd,
}

impl EventKind {
    /// Kinds queried on the token contract.
    pub const TOKEN_KINDS: [EventKind; 3] = [EventKind::Mint, EventKind::Transfer, EventKind::Burn];
    /// Kinds queried on the bridge contract.
    pub const BRIDGE_KINDS: [EventKind; 2] = [EventKind::BridgeStart, EventKind::BridgeEnd];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Unknown => "UNKNOWN",
            EventKind::Mint => "MINT",
            EventKind::Transfer => "TRANSFER",
            EventKind::Burn => "BURN",
            EventKind::BridgeStart => "BRIDGE_START",
            EventKind::BridgeEnd => "BRIDGE_END",
        }
    }

    /// Mint, transfer and burn all decode to a [`TransferArgs`] payload.
    pub fn is_transfer_family(&self) -> bool {
        matches!(self, EventKind::Mint | EventKind::Transfer | EventKind::Burn)
    }

    pub fn is_bridge(&self) -> bool {
        matches!(self, EventKind::BridgeStart | EventKind::BridgeEnd)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "UNKNOWN" => Ok(EventKind::Unknown),
            "MINT" => Ok(EventKind::Mint),
            "TRANSFER" => Ok(EventKind::Transfer),
            "BURN" => Ok(EventKind::Burn),
            "BRIDGE_START" | "BRIDGESTART" => Ok(EventKind::BridgeStart),
            "BRIDGE_END" | "BRIDGEEND" => Ok(EventKind::BridgeEnd),
            _ => Err(ParseError::InvalidValue {
                field: "event kind",
                value: s.to_string(),
            }),
        }
    }
}

/// Mint/transfer/burn payload. `amount` is a decimal string with 18-decimal precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferArgs {
    pub from: Address,
    pub to: Address,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStartArgs {
    pub token: Address,
    pub sender: Address,
    pub value: String,
    pub message_id: H256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeEndArgs {
    pub token: Address,
    pub recipient: Address,
    pub value: String,
    pub message_id: H256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape")]
pub enum EventArgs {
    Transfer(TransferArgs),
    BridgeStart(BridgeStartArgs),
    BridgeEnd(BridgeEndArgs),
    Unknown { args: Vec<Value> },
}

/// A record from a local events file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    #[serde(default, alias = "_id")]
    pub id: Option<String>,
    pub event_signature: String,
    #[serde(deserialize_with = "deserialize_lenient_u64")]
    pub block_number: u64,
    pub block_hash: H256,
    pub transaction_hash: H256,
    #[serde(deserialize_with = "deserialize_lenient_u64")]
    pub log_index: u64,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// A classified event belonging to one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEvent {
    pub id: String,
    pub chain_id: u64,
    pub block_number: u64,
    pub block_hash: H256,
    pub transaction_hash: H256,
    pub log_index: u64,
    pub event_signature: String,
    pub kind: EventKind,
    pub args: EventArgs,
}

/// `"{chain}:{tx}:{log_index}"`, stable across re-extraction.
pub fn stable_id(chain_id: u64, transaction_hash: &H256, log_index: u64) -> String {
    format!("{}:{:?}:{}", chain_id, transaction_hash, log_index)
}

/// MINT when minted from the void, BURN when sent to it, TRANSFER otherwise.
pub fn classify_transfer(from: &Address, to: &Address) -> EventKind {
    if *from == VOID_ADDRESS {
        EventKind::Mint
    } else if *to == VOID_ADDRESS {
        EventKind::Burn
    } else {
        EventKind::Transfer
    }
}

/// Renders a raw 18-decimal amount the way JS `formatUnits` does (`5000000000000000000` -> `5.0`).
pub fn format_amount(value: U256) -> String {
    let formatted = match format_units(value, TOKEN_DECIMALS) {
        Ok(formatted) => formatted,
        Err(_) => return value.to_string(),
    };
    match formatted.split_once('.') {
        Some((whole, fraction)) => {
            let fraction = fraction.trim_end_matches('0');
            if fraction.is_empty() {
                format!("{}.0", whole)
            } else {
                format!("{}.{}", whole, fraction)
            }
        }
        None => format!("{}.0", formatted),
    }
}

/// Reads an integer amount from a JSON value.
///
/// Accepts decimal strings, `0x` hex strings, JSON numbers and the `{ "type": "BigNumber", "hex": .. }`
/// / `{ "_hex": .. }` objects produced when ethers.js values are serialised.
pub fn parse_u256(value: &Value) -> Result<U256, ParseError> {
    let invalid = || ParseError::InvalidValue {
        field: "amount",
        value: value.to_string(),
    };
    match value {
        Value::String(s) => parse_u256_str(s).ok_or_else(invalid),
        Value::Number(n) => n.as_u64().map(U256::from).ok_or_else(invalid),
        Value::Object(map) => map
            .get("hex")
            .or_else(|| map.get("_hex"))
            .and_then(Value::as_str)
            .and_then(parse_u256_str)
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

fn parse_u256_str(s: &str) -> Option<U256> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        U256::from_str_radix(hex, 16).ok()
    } else {
        U256::from_dec_str(s).ok()
    }
}

/// Amount column: already-formatted decimals (`"5.0"`) pass through, integers are scaled down.
pub fn parse_amount(value: &Value) -> Result<String, ParseError> {
    if let Value::String(s) = value {
        let s = s.trim();
        if let Some((whole, fraction)) = s.split_once('.') {
            let digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
            if digits(whole) && digits(fraction) {
                return Ok(s.to_string());
            }
            return Err(ParseError::InvalidValue {
                field: "amount",
                value: s.to_string(),
            });
        }
    }
    parse_u256(value).map(format_amount)
}

fn parse_address(value: &Value, field: &'static str) -> Result<Address, ParseError> {
    value
        .as_str()
        .and_then(|s| Address::from_str(s.trim()).ok())
        .ok_or_else(|| ParseError::InvalidValue {
            field,
            value: value.to_string(),
        })
}

fn parse_h256(value: &Value, field: &'static str) -> Result<H256, ParseError> {
    value
        .as_str()
        .and_then(|s| H256::from_str(s.trim()).ok())
        .ok_or_else(|| ParseError::InvalidValue {
            field,
            value: value.to_string(),
        })
}

fn check_arity(kind: EventKind, args: &[Value], expected: usize) -> Result<(), ParseError> {
    if args.len() != expected {
        return Err(ParseError::ArgumentArity {
            kind,
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

impl EventArgs {
    /// Kind implied by the payload. Transfers are refined against the void address.
    pub fn kind(&self) -> EventKind {
        match self {
            EventArgs::Transfer(t) => classify_transfer(&t.from, &t.to),
            EventArgs::BridgeStart(_) => EventKind::BridgeStart,
            EventArgs::BridgeEnd(_) => EventKind::BridgeEnd,
            EventArgs::Unknown { .. } => EventKind::Unknown,
        }
    }

    fn from_positional(kind: EventKind, args: Vec<Value>) -> Result<Self, ParseError> {
        match kind {
            EventKind::Mint | EventKind::Transfer | EventKind::Burn => {
                check_arity(kind, &args, TRANSFER_ARITY)?;
                Ok(EventArgs::Transfer(TransferArgs {
                    from: parse_address(&args[0], "from")?,
                    to: parse_address(&args[1], "to")?,
                    amount: parse_amount(&args[2])?,
                }))
            }
            EventKind::BridgeStart => {
                check_arity(kind, &args, BRIDGE_ARITY)?;
                Ok(EventArgs::BridgeStart(BridgeStartArgs {
                    token: parse_address(&args[0], "token")?,
                    sender: parse_address(&args[1], "sender")?,
                    value: parse_amount(&args[2])?,
                    message_id: parse_h256(&args[3], "messageId")?,
                }))
            }
            EventKind::BridgeEnd => {
                check_arity(kind, &args, BRIDGE_ARITY)?;
                Ok(EventArgs::BridgeEnd(BridgeEndArgs {
                    token: parse_address(&args[0], "token")?,
                    recipient: parse_address(&args[1], "recipient")?,
                    value: parse_amount(&args[2])?,
                    message_id: parse_h256(&args[3], "messageId")?,
                }))
            }
            EventKind::Unknown => Ok(EventArgs::Unknown { args }),
        }
    }
}

impl ChainEvent {
    /// Builds an event whose kind is derived from its payload and whose id is the stable id.
    pub fn new(
        chain_id: u64,
        block_number: u64,
        block_hash: H256,
        transaction_hash: H256,
        log_index: u64,
        event_signature: impl Into<String>,
        args: EventArgs,
    ) -> Self {
        Self {
            id: stable_id(chain_id, &transaction_hash, log_index),
            chain_id,
            block_number,
            block_hash,
            transaction_hash,
            log_index,
            event_signature: event_signature.into(),
            kind: args.kind(),
            args,
        }
    }

    /// Classifies a file record using the chain's signature map.
    ///
    /// Unmapped signatures become [`EventKind::Unknown`] events carrying their raw args.
    pub fn from_raw(raw: RawLog, chain: &ChainConfig) -> Result<Self, ParseError> {
        let mapped = chain.kind_for_signature(&raw.event_signature);
        let args = EventArgs::from_positional(mapped, raw.args)?;
        let mut event = ChainEvent::new(
            chain.chain_id,
            raw.block_number,
            raw.block_hash,
            raw.transaction_hash,
            raw.log_index,
            raw.event_signature,
            args,
        );
        if let Some(id) = raw.id.filter(|id| !id.trim().is_empty()) {
            event.id = id;
        }
        Ok(event)
    }

    /// Decodes an RPC log that was queried for `kind`.
    ///
    /// Topic layouts: `Transfer(from, to)`, `Minted/Burned(operator, holder)` with the holder as
    /// the last indexed topic, and `(token, party, messageId)` for both bridge events. The amount
    /// is always the first data word.
    pub fn from_log(
        chain_id: u64,
        kind: EventKind,
        event_signature: &str,
        log: &Log,
    ) -> Result<Self, ParseError> {
        let malformed = |reason: &str| ParseError::MalformedLog {
            transaction_hash: log.transaction_hash,
            reason: reason.to_string(),
        };
        let block_number = log
            .block_number
            .ok_or_else(|| malformed("pending log without block number"))?
            .as_u64();
        let block_hash = log.block_hash.ok_or_else(|| malformed("missing block hash"))?;
        let transaction_hash = log
            .transaction_hash
            .ok_or_else(|| malformed("missing transaction hash"))?;
        let log_index = log
            .log_index
            .ok_or_else(|| malformed("missing log index"))?
            .low_u64();

        let data = log.data.as_ref();
        if data.len() < 32 {
            return Err(malformed("data shorter than one word"));
        }
        let amount = format_amount(U256::from_big_endian(&data[0..32]));
        let topics = &log.topics;

        let args = match kind {
            EventKind::Transfer => {
                if topics.len() < 3 {
                    return Err(malformed("transfer needs indexed from and to"));
                }
                EventArgs::Transfer(TransferArgs {
                    from: Address::from(topics[1]),
                    to: Address::from(topics[2]),
                    amount,
                })
            }
            EventKind::Mint | EventKind::Burn => {
                if topics.len() < 2 {
                    return Err(malformed("mint/burn needs an indexed holder"));
                }
                let holder = Address::from(topics[topics.len() - 1]);
                let (from, to) = if kind == EventKind::Mint {
                    (VOID_ADDRESS, holder)
                } else {
                    (holder, VOID_ADDRESS)
                };
                EventArgs::Transfer(TransferArgs { from, to, amount })
            }
            EventKind::BridgeStart => {
                if topics.len() < 4 {
                    return Err(malformed("bridge start needs token, sender and message id"));
                }
                EventArgs::BridgeStart(BridgeStartArgs {
                    token: Address::from(topics[1]),
                    sender: Address::from(topics[2]),
                    value: amount,
                    message_id: topics[3],
                })
            }
            EventKind::BridgeEnd => {
                if topics.len() < 4 {
                    return Err(malformed("bridge end needs token, recipient and message id"));
                }
                EventArgs::BridgeEnd(BridgeEndArgs {
                    token: Address::from(topics[1]),
                    recipient: Address::from(topics[2]),
                    value: amount,
                    message_id: topics[3],
                })
            }
            EventKind::Unknown => return Err(malformed("cannot decode a log of unknown kind")),
        };

        Ok(ChainEvent::new(
            chain_id,
            block_number,
            block_hash,
            transaction_hash,
            log_index,
            event_signature,
            args,
        ))
    }

    pub fn transfer(&self) -> Option<&TransferArgs> {
        match &self.args {
            EventArgs::Transfer(t) => Some(t),
            _ => None,
        }
    }

    pub fn bridge_start(&self) -> Option<&BridgeStartArgs> {
        match &self.args {
            EventArgs::BridgeStart(b) => Some(b),
            _ => None,
        }
    }

    pub fn bridge_end(&self) -> Option<&BridgeEndArgs> {
        match &self.args {
            EventArgs::BridgeEnd(b) => Some(b),
            _ => None,
        }
    }

    /// Replaces the transfer endpoints and re-derives the kind. No-op for non-transfers.
    pub fn with_endpoints(mut self, from: Address, to: Address) -> Self {
        if let EventArgs::Transfer(t) = &mut self.args {
            t.from = from;
            t.to = to;
            self.kind = classify_transfer(&t.from, &t.to);
        }
        self
    }
}
