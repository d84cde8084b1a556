//! # Token Flow SDK
//!
//! A Rust library for extracting token transfer and bridge events from several EVM chains and
//! folding them into a weighted transfer graph for visual exploration.
//!
//! ## Overview
//!
//! - **Extraction**: per-chain event retrieval from a local file, an indexer or live RPC, with
//!   range bisection against provider limits
//! - **Classification**: raw logs become typed mint/transfer/burn/bridge events
//! - **Persistence**: events and per-chain extraction stats in a keyed store (memory or PostgreSQL)
//! - **Graph**: a weighted multigraph with weight and event-kind filters
//! - **Reconciliation**: bridged transfers collapsed into one `sender → recipient` edge
//!
//! ## Architecture
//!
//! ### Extraction Layer
//! [`extractors::ExtractorFactory`] hands out one [`extractor::ChainExtractor`] per source. The
//! RPC source walks block windows through [`block_range::RangeFetcher`].
//!
//! ### Orchestration Layer
//! [`orchestrator::ExtractionOrchestrator`] runs the per-chain cache check, source fallback and
//! atomic persistence, writing a [`stats::Stat`] last.
//!
//! ### Graph Layer
//! [`graph_service::TransferGraph`] folds stored events; [`reconciler::CrossChainReconciler`]
//! produces the replacement transfers for bridged messages.

// Core Types
/// Error taxonomy
pub mod error;
/// Typed chain events and classification
pub mod events;
/// Per-chain extraction stat
pub mod stats;

// Extraction Layer
/// Trait for event sources
pub mod extractor;
/// File, indexer and RPC sources plus the factory
pub mod extractors;
/// Block-range fetching with bisection
pub mod block_range;
/// Per-chain extraction state machine
pub mod orchestrator;

// Graph Layer
/// Weighted transfer graph and filters
pub mod graph_service;
/// Cross-chain bridge reconciliation
pub mod reconciler;

// Infrastructure
/// Event and stat store traits with in-memory implementations
pub mod store;
/// PostgreSQL database integration
pub mod database;
/// Metrics and observability
pub mod metrics;

// Utilities
/// General utilities
pub mod utils;

// Settings & Configuration
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use events::{ChainEvent, EventKind};
pub use extractor::{ChainExtractor, ExtractorKind};
pub use graph_service::{FilterState, GraphView, TransferGraph};
pub use orchestrator::ExtractionOrchestrator;
pub use reconciler::CrossChainReconciler;
pub use settings::{ChainConfig, Settings};
