//! # Error taxonomy
//!
//! Every failure the extraction pipeline can raise, grouped by the layer that raises it.
//!
//! - [`ConfigError`]: a chain descriptor is missing a field or carries an invalid value. Aborts
//!   that chain only.
//! - [`ProviderError`]: a single provider call failed. `RangeTooLarge` drives bisection in
//!   [`crate::block_range::RangeFetcher`]; the other variants surface immediately.
//! - [`ParseError`]: a raw payload (file record, RPC log, indexer page) could not be decoded.
//! - [`ExtractionError`]: what an extractor returns. Wraps all of the above so callers never
//!   see transport-specific errors.
//! - [`StoreError`]: persistence failures. `Unavailable` is fatal to a whole run, `Insert`
//!   only fails the chain whose batch was rejected.
//! - [`ReconciliationError`]: a bridged message is missing one of its legs.

use ethers::types::H256;
use std::time::Duration;

use crate::events::EventKind;

/// Invalid or incomplete chain descriptor.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("chain {chain_id}: missing {field}")]
    MissingField { chain_id: u64, field: &'static str },
    #[error("chain {chain_id}: invalid {field} '{value}'")]
    InvalidValue {
        chain_id: u64,
        field: &'static str,
        value: String,
    },
    #[error("invalid event signature map: {0}")]
    InvalidSignatureMap(String),
    #[error("chain {0} is configured more than once")]
    DuplicateChain(u64),
}

/// Failure of one provider round-trip.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The provider refused the window (too many results, span too large).
    #[error("range too large: {0}")]
    RangeTooLarge(String),
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Classifies a provider error message.
    ///
    /// Providers do not agree on an error code for oversized log queries, so the message text is
    /// matched against the phrasings used by the common node implementations and hosted RPCs.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        // Rate limiting shares wording with range errors but must not shrink the window.
        if lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit") {
            return ProviderError::Transport(message);
        }
        let range_markers = [
            "too many",
            "-32005",
            "block range",
            "range too large",
            "range is too large",
            "exceed maximum block range",
            "more than",
            "limit exceeded",
            "response size",
            "query timeout exceeded",
        ];
        if range_markers.iter().any(|marker| lower.contains(marker)) {
            ProviderError::RangeTooLarge(message)
        } else {
            ProviderError::Transport(message)
        }
    }

    pub fn is_range_error(&self) -> bool {
        matches!(self, ProviderError::RangeTooLarge(_))
    }
}

/// Malformed raw payload.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("event source {0} is not a JSON array")]
    NotAnArray(String),
    #[error("record {index}: {reason}")]
    InvalidRecord { index: usize, reason: String },
    #[error("{kind:?} expects {expected} arguments, got {actual}")]
    ArgumentArity {
        kind: EventKind,
        expected: usize,
        actual: usize,
    },
    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("log {transaction_hash:?}: {reason}")]
    MalformedLog {
        transaction_hash: Option<H256>,
        reason: String,
    },
    #[error("unexpected indexer response shape: {0}")]
    Protocol(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failure of an extractor. The orchestrator turns these into a failed chain stat.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("blocks {from_block}..={to_block}: {source}")]
    Provider {
        from_block: u64,
        to_block: u64,
        #[source]
        source: ProviderError,
    },
    #[error("could not read current block number: {0}")]
    BlockNumber(#[source] ProviderError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("indexer request failed: {0}")]
    Http(String),
    #[error("indexer returned an error: {0}")]
    Indexer(String),
}

impl ExtractionError {
    /// Whether running the same extraction again may succeed (timeouts, transport hiccups).
    pub fn is_retryable(&self) -> bool {
        match self {
            ExtractionError::Provider { source, .. } | ExtractionError::BlockNumber(source) => {
                matches!(
                    source,
                    ProviderError::Timeout(_) | ProviderError::Transport(_)
                )
            }
            ExtractionError::Http(_) => true,
            _ => false,
        }
    }
}

/// Persistence failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store cannot be reached. Fatal to the whole run.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A batch insert was rejected as a whole. Nothing from the batch was applied.
    #[error("insert of {total} events for chain {chain_id} failed: {reason}")]
    Insert {
        chain_id: u64,
        total: usize,
        reason: String,
    },
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

/// A bridged message whose legs could not all be matched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconciliationError {
    #[error("bridge start {message_id:?} has no transfer in transaction {transaction_hash:?}")]
    MissingOriginTransfer {
        message_id: H256,
        transaction_hash: H256,
    },
    #[error("bridge message {message_id:?} has no bridge end on the destination chain")]
    MissingBridgeEnd { message_id: H256 },
    #[error("bridge message {message_id:?} has no destination transfer in {transaction_hash:?}")]
    MissingDestinationTransfer {
        message_id: H256,
        transaction_hash: H256,
    },
}

/// Errors that abort an orchestrator run.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_range_errors() {
        let err = ProviderError::classify("query returned more than 10000 results");
        assert!(err.is_range_error());
        let err = ProviderError::classify("Log response size exceeded. You can make eth_getLogs requests with up to a 2K block range");
        assert!(err.is_range_error());
        let err = ProviderError::classify("error code -32005: limit exceeded");
        assert!(err.is_range_error());
    }

    #[test]
    fn test_classify_transport_errors() {
        let err = ProviderError::classify("connection refused");
        assert!(!err.is_range_error());
        assert!(matches!(err, ProviderError::Transport(_)));
        let err = ProviderError::classify("HTTP 429: Too Many Requests");
        assert!(!err.is_range_error());
    }

    #[test]
    fn test_retryable_extraction_errors() {
        let timeout = ExtractionError::Provider {
            from_block: 1,
            to_block: 2,
            source: ProviderError::Timeout(Duration::from_secs(1)),
        };
        assert!(timeout.is_retryable());

        let parse = ExtractionError::Parse(ParseError::NotAnArray("events.json".to_string()));
        assert!(!parse.is_retryable());
    }
}
