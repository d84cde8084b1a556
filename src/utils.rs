// src/utils.rs
// Utility functions for Token Flow SDK

use ethers::types::Address;
use serde::de::{self, Deserializer, Visitor};
use std::fmt;

/// Creates a vector of (start_block, end_block) tuples for a given range and chunk size.
/// Used to pre-split long RPC windows before range bisection kicks in.
pub fn create_block_chunks(from_block: u64, to_block: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut current_from = from_block;
    while current_from <= to_block {
        let current_to = std::cmp::min(current_from.saturating_add(chunk_size - 1), to_block);
        chunks.push((current_from, current_to));
        match current_to.checked_add(1) {
            Some(next) => current_from = next,
            None => break,
        }
    }
    chunks
}

/// Full lowercase hex (`Display` on `Address` abbreviates).
pub fn address_to_string(addr: &Address) -> String {
    format!("{:?}", addr).to_lowercase()
}

/// Display abbreviation used for graph node names: `0x` plus the first four hex digits.
pub fn abbreviate_address(addr: &Address) -> String {
    let full = address_to_string(addr);
    full.chars().take(6).collect()
}

/// Accepts `12`, `"12"` and `"0xc"` for block numbers and log indexes.
pub fn deserialize_lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct LenientU64;

    impl<'de> Visitor<'de> for LenientU64 {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an unsigned integer or a decimal/hex string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::custom(format!("negative value {}", v)))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<u64, E> {
            if v >= 0.0 && v.fract() == 0.0 && v <= u64::MAX as f64 {
                Ok(v as u64)
            } else {
                Err(E::custom(format!("not an integer: {}", v)))
            }
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            parse_u64(v).ok_or_else(|| E::custom(format!("invalid integer '{}'", v)))
        }
    }

    deserializer.deserialize_any(LenientU64)
}

pub fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_create_block_chunks() {
        assert_eq!(create_block_chunks(0, 9, 4), vec![(0, 3), (4, 7), (8, 9)]);
        assert_eq!(create_block_chunks(5, 5, 100), vec![(5, 5)]);
        assert!(create_block_chunks(6, 5, 100).is_empty());
        assert_eq!(create_block_chunks(0, 2, 0), vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[test]
    fn test_abbreviate_address() {
        let addr = Address::from_str("0xAbCd111111111111111111111111111111111111").unwrap();
        assert_eq!(abbreviate_address(&addr), "0xabcd");
        assert_eq!(
            address_to_string(&addr),
            "0xabcd111111111111111111111111111111111111"
        );
    }

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64("0x10"), Some(16));
        assert_eq!(parse_u64(" 42 "), Some(42));
        assert_eq!(parse_u64("abc"), None);
    }
}
