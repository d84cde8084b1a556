//! # Extraction Orchestrator
//!
//! The `ExtractionOrchestrator` decides, per chain, whether events must be extracted, runs the
//! source fallback policy and persists events plus the chain's [`Stat`].
//!
//! ## Per-chain state machine
//!
//! `IDLE → CHECKING_CACHE → (CACHED | EXTRACTING) → PERSISTING → DONE`
//!
//! - **CHECKING_CACHE**: load or create the chain's stat. A stat written by another application
//!   version clears every chain's events and stats.
//! - **CACHED**: the store already holds events for the chain; nothing is extracted.
//! - **EXTRACTING**: sources are tried in [`fallback_order`] until one returns events.
//! - **PERSISTING**: the batch is inserted atomically, then the stat is written last.
//!
//! Extraction failures never escape: they become a failed stat and a [`ChainOutcome::Failed`]
//! report. Only an unreachable store aborts the run.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use token_flow_sdk::extractors::ExtractorFactory;
//! use token_flow_sdk::orchestrator::ExtractionOrchestrator;
//! use token_flow_sdk::settings::Settings;
//! use token_flow_sdk::store::{MemoryEventStore, MemoryStatStore};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let settings = Settings::new()?;
//! let orchestrator = ExtractionOrchestrator::new(
//!     ExtractorFactory::from_settings(&settings),
//!     Arc::new(MemoryEventStore::new()),
//!     Arc::new(MemoryStatStore::new()),
//!     settings.app.version.clone(),
//! )
//! .with_concurrency(settings.extraction.concurrency);
//!
//! for report in orchestrator.extract_all(&settings.chains).await? {
//!     println!("{}: {:?}", report.chain_id, report.outcome);
//! }
//! # Ok(())
//! # }
//! ```

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ExtractionError, OrchestratorError, StoreError};
use crate::events::ChainEvent;
use crate::extractor::ExtractorKind;
use crate::extractors::ExtractorFactory;
use crate::metrics;
use crate::settings::ChainConfig;
use crate::stats::Stat;
use crate::store::{EventStore, StatStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionPhase {
    Idle,
    CheckingCache,
    Cached,
    Extracting,
    Persisting,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChainOutcome {
    /// Test chain, never extracted.
    Skipped,
    /// Events were already stored.
    Cached,
    Extracted { source: ExtractorKind, events: usize },
    /// Nothing was persisted; the failure stat is retained.
    Failed { reason: String },
}

impl ChainOutcome {
    fn label(&self) -> &'static str {
        match self {
            ChainOutcome::Skipped => "skipped",
            ChainOutcome::Cached => "cached",
            ChainOutcome::Extracted { .. } => "extracted",
            ChainOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub chain_id: u64,
    pub outcome: ChainOutcome,
    pub stat: Option<Stat>,
}

/// Sources to try for a chain: the local file first, then the indexer and RPC when configured.
pub fn fallback_order(chain: &ChainConfig) -> Vec<ExtractorKind> {
    let mut order = vec![ExtractorKind::File];
    if chain.graph_url.is_some() {
        order.push(ExtractorKind::Graphql);
    }
    if chain.rpc_url.is_some() {
        order.push(ExtractorKind::Rpc);
    }
    order
}

/// Why the fallback chain produced nothing. `error` is `None` when every source ran cleanly but
/// found no events.
#[derive(Debug, Default)]
struct FallbackFailure {
    last_tried: Option<ExtractorKind>,
    error: Option<ExtractionError>,
}

/// Store errors other than a rejected insert are fatal to the whole run.
fn fatal(err: StoreError) -> OrchestratorError {
    OrchestratorError::Store(err)
}

pub struct ExtractionOrchestrator {
    factory: ExtractorFactory,
    events: Arc<dyn EventStore>,
    stats: Arc<dyn StatStore>,
    app_version: String,
    concurrency: usize,
}

impl ExtractionOrchestrator {
    pub fn new(
        factory: ExtractorFactory,
        events: Arc<dyn EventStore>,
        stats: Arc<dyn StatStore>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            factory,
            events,
            stats,
            app_version: app_version.into(),
            concurrency: 1,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    fn enter(&self, chain_id: u64, phase: ExtractionPhase) {
        debug!(chain_id, phase = ?phase, "Extraction phase");
    }

    /// Extracts every chain. Stale versions are invalidated before any chain starts.
    ///
    /// Reports come back in the order of `chains`.
    pub async fn extract_all(&self, chains: &[ChainConfig]) -> Result<Vec<ChainReport>, OrchestratorError> {
        for chain in chains.iter().filter(|c| !c.test) {
            self.check_cache(chain.chain_id).await?;
        }

        let results: Vec<Result<ChainReport, OrchestratorError>> = stream::iter(chains)
            .map(|chain| self.extract_chain(chain))
            .buffered(self.concurrency)
            .collect()
            .await;

        let reports = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        let extracted = reports
            .iter()
            .filter(|r| matches!(r.outcome, ChainOutcome::Extracted { .. }))
            .count();
        let failed = reports
            .iter()
            .filter(|r| matches!(r.outcome, ChainOutcome::Failed { .. }))
            .count();
        info!(chains = reports.len(), extracted, failed, "Extraction run complete");
        Ok(reports)
    }

    /// Runs the state machine for one chain.
    pub async fn extract_chain(&self, chain: &ChainConfig) -> Result<ChainReport, OrchestratorError> {
        let chain_id = chain.chain_id;
        self.enter(chain_id, ExtractionPhase::Idle);

        if chain.test {
            debug!(chain_id, "Test chain, skipping extraction");
            return Ok(self.report(chain_id, ChainOutcome::Skipped, None));
        }

        self.enter(chain_id, ExtractionPhase::CheckingCache);
        let mut stat = self.check_cache(chain_id).await?;

        if self.events.exists_for_chain(chain_id).await.map_err(fatal)? {
            self.enter(chain_id, ExtractionPhase::Cached);
            info!(chain_id, "Events already stored, skipping extraction");
            self.enter(chain_id, ExtractionPhase::Done);
            return Ok(self.report(chain_id, ChainOutcome::Cached, Some(stat)));
        }

        if let Err(e) = chain.validate() {
            warn!(chain_id, error = %e, "Invalid chain configuration");
            return self.fail(chain_id, &mut stat, None, e.to_string()).await;
        }

        self.enter(chain_id, ExtractionPhase::Extracting);
        let (source, events) = match self.run_fallback(chain).await {
            Ok(found) => found,
            Err(failure) => {
                let reason = failure
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no source returned events".to_string());
                warn!(chain_id, %reason, "Extraction failed");
                return self.fail(chain_id, &mut stat, failure.last_tried, reason).await;
            }
        };

        self.enter(chain_id, ExtractionPhase::Persisting);
        match self.events.insert_many(chain_id, &events).await {
            Ok(_) => {}
            Err(err @ StoreError::Insert { .. }) => {
                warn!(chain_id, error = %err, "Insert rejected, discarding batch");
                return self.fail(chain_id, &mut stat, Some(source), err.to_string()).await;
            }
            Err(err) => return Err(fatal(err)),
        }

        let last_block = match self.events.last_block_by_chain(chain_id).await.map_err(fatal)? {
            Some(block) => block,
            None => events.iter().map(|e| e.block_number).max().unwrap_or(0),
        };
        stat.version = self.app_version.clone();
        stat.record_success(source, last_block);
        // Stat goes last, after the batch is durable.
        self.stats.upsert(&stat).await.map_err(fatal)?;
        metrics::set_stored_events(chain_id, events.len());

        self.enter(chain_id, ExtractionPhase::Done);
        info!(
            chain_id,
            source = %source,
            events = events.len(),
            last_block,
            "Chain extracted"
        );
        Ok(self.report(
            chain_id,
            ChainOutcome::Extracted {
                source,
                events: events.len(),
            },
            Some(stat),
        ))
    }

    /// Loads the chain's stat; a version mismatch wipes every chain before recreating it.
    async fn check_cache(&self, chain_id: u64) -> Result<Stat, OrchestratorError> {
        let stat = self
            .stats
            .get_or_create(chain_id, &self.app_version)
            .await
            .map_err(fatal)?;
        if stat.version == self.app_version {
            return Ok(stat);
        }

        info!(
            chain_id,
            stored_version = %stat.version,
            current_version = %self.app_version,
            "Application version changed, clearing all stored events and stats"
        );
        self.events.clear_all().await.map_err(fatal)?;
        self.stats.clear_all().await.map_err(fatal)?;
        self.stats
            .get_or_create(chain_id, &self.app_version)
            .await
            .map_err(fatal)
    }

    /// Tries each source in order, stopping at the first non-empty result.
    ///
    async fn run_fallback(
        &self,
        chain: &ChainConfig,
    ) -> Result<(ExtractorKind, Vec<ChainEvent>), FallbackFailure> {
        let mut failure = FallbackFailure::default();
        for kind in fallback_order(chain) {
            failure.last_tried = Some(kind);
            let extractor = self.factory.get(kind);
            match extractor.extract(chain).await {
                Ok(events) if !events.is_empty() => return Ok((kind, events)),
                Ok(_) => {
                    debug!(chain_id = chain.chain_id, source = %kind, "Source returned no events");
                }
                Err(e) => {
                    warn!(
                        chain_id = chain.chain_id,
                        source = %kind,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Source failed, falling back"
                    );
                    failure.error = Some(e);
                }
            }
            metrics::increment_fallback(kind);
        }
        Err(failure)
    }

    /// Clears partial state for the chain and records a failed stat.
    async fn fail(
        &self,
        chain_id: u64,
        stat: &mut Stat,
        last_tried: Option<ExtractorKind>,
        reason: String,
    ) -> Result<ChainReport, OrchestratorError> {
        self.events.clear_chain(chain_id).await.map_err(fatal)?;
        stat.version = self.app_version.clone();
        stat.record_failure(last_tried);
        self.stats.upsert(stat).await.map_err(fatal)?;
        self.enter(chain_id, ExtractionPhase::Done);
        Ok(self.report(chain_id, ChainOutcome::Failed { reason }, Some(stat.clone())))
    }

    fn report(&self, chain_id: u64, outcome: ChainOutcome, stat: Option<Stat>) -> ChainReport {
        metrics::increment_chain_outcome(outcome.label());
        ChainReport {
            chain_id,
            outcome,
            stat,
        }
    }
}
