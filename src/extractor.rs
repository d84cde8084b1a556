//! # Chain Extractor Trait
//!
//! The core abstraction for turning a [`ChainConfig`] into the list of [`ChainEvent`]s for that
//! chain. Every event source (local file, indexer, live RPC) implements [`ChainExtractor`]; the
//! orchestrator only ever talks to the trait.
//!
//! ## Adding a New Source
//!
//! 1. Implement [`ChainExtractor`] in a new file under `extractors/`
//! 2. Add an [`ExtractorKind`] variant
//! 3. Register it in [`crate::extractors::ExtractorFactory`] and in the orchestrator's fallback
//!    order
//!
//! ## Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use token_flow_sdk::error::ExtractionError;
//! use token_flow_sdk::events::ChainEvent;
//! use token_flow_sdk::extractor::{ChainExtractor, ExtractorKind};
//! use token_flow_sdk::settings::ChainConfig;
//!
//! struct NoopExtractor;
//!
//! #[async_trait]
//! impl ChainExtractor for NoopExtractor {
//!     fn kind(&self) -> ExtractorKind {
//!         ExtractorKind::File
//!     }
//!
//!     async fn extract(&self, _chain: &ChainConfig) -> Result<Vec<ChainEvent>, ExtractionError> {
//!         Ok(Vec::new())
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ExtractionError;
use crate::events::ChainEvent;
use crate::settings::ChainConfig;

/// Event source, in fallback priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractorKind {
    File,
    Graphql,
    Rpc,
}

impl ExtractorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractorKind::File => "FILE",
            ExtractorKind::Graphql => "GRAPHQL",
            ExtractorKind::Rpc => "RPC",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FILE" => Some(ExtractorKind::File),
            "GRAPHQL" => Some(ExtractorKind::Graphql),
            "RPC" => Some(ExtractorKind::Rpc),
            _ => None,
        }
    }
}

impl fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event source.
///
/// Implementations must wrap every failure in [`ExtractionError`]; an empty `Ok` means the source
/// had nothing for the chain (for example no file configured), which lets the orchestrator move
/// on to the next source.
#[async_trait]
pub trait ChainExtractor: Send + Sync {
    fn kind(&self) -> ExtractorKind;

    async fn extract(&self, chain: &ChainConfig) -> Result<Vec<ChainEvent>, ExtractionError>;
}
