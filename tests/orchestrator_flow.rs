//! Integration tests for the extraction orchestrator
//!
//! Tests cover:
//! - Cache hits on a second run
//! - Version invalidation across every chain
//! - Source fallback order
//! - Atomic batch rejection and fatal store outages
//! - Concurrent chains bounded by the configured concurrency
//!
//! Sources are scripted in-process; no network access.

use async_trait::async_trait;
use ethers::types::{Address, H256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use token_flow_sdk::error::ExtractionError;
use token_flow_sdk::events::{ChainEvent, EventArgs, TransferArgs};
use token_flow_sdk::extractors::ExtractorFactory;
use token_flow_sdk::orchestrator::{ChainOutcome, ExtractionOrchestrator};
use token_flow_sdk::settings::ChainConfig;
use token_flow_sdk::store::{EventStore, MemoryEventStore, MemoryStatStore, StatStore};
use token_flow_sdk::{ChainExtractor, ExtractorKind};

enum Script {
    Events(usize),
    Fail(&'static str),
}

struct ScriptedExtractor {
    kind: ExtractorKind,
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedExtractor {
    fn new(kind: ExtractorKind, script: Script) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn transfer(chain_id: u64, n: u64) -> ChainEvent {
    ChainEvent::new(
        chain_id,
        100 + n,
        H256::from_low_u64_be(n),
        H256::from_low_u64_be(1_000 + n),
        0,
        "Transfer(address,address,uint256)",
        EventArgs::Transfer(TransferArgs {
            from: Address::repeat_byte(0x11),
            to: Address::repeat_byte(0x22),
            amount: "1.0".to_string(),
        }),
    )
}

#[async_trait]
impl ChainExtractor for ScriptedExtractor {
    fn kind(&self) -> ExtractorKind {
        self.kind
    }

    async fn extract(&self, chain: &ChainConfig) -> Result<Vec<ChainEvent>, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Events(count) => Ok((0..*count as u64)
                .map(|n| transfer(chain.chain_id, n))
                .collect()),
            Script::Fail(reason) => Err(ExtractionError::Indexer(reason.to_string())),
        }
    }
}

struct Harness {
    file: Arc<ScriptedExtractor>,
    graphql: Arc<ScriptedExtractor>,
    rpc: Arc<ScriptedExtractor>,
    events: Arc<MemoryEventStore>,
    stats: Arc<MemoryStatStore>,
}

impl Harness {
    fn new(file: Script, graphql: Script, rpc: Script) -> Self {
        Self {
            file: ScriptedExtractor::new(ExtractorKind::File, file),
            graphql: ScriptedExtractor::new(ExtractorKind::Graphql, graphql),
            rpc: ScriptedExtractor::new(ExtractorKind::Rpc, rpc),
            events: Arc::new(MemoryEventStore::new()),
            stats: Arc::new(MemoryStatStore::new()),
        }
    }

    fn orchestrator(&self, version: &str) -> ExtractionOrchestrator {
        let factory = ExtractorFactory::new(self.file.clone(), self.graphql.clone(), self.rpc.clone());
        ExtractionOrchestrator::new(factory, self.events.clone(), self.stats.clone(), version)
            .with_concurrency(2)
    }
}

fn full_chain(chain_id: u64) -> ChainConfig {
    ChainConfig::new(chain_id)
        .with_graph_url("http://localhost:8000/subgraphs/name/token")
        .with_rpc_url("http://localhost:8545")
        .with_token_contract(Address::repeat_byte(0x70))
}

#[tokio::test]
async fn test_second_run_is_served_from_cache() {
    let harness = Harness::new(Script::Events(3), Script::Events(0), Script::Events(0));
    let orchestrator = harness.orchestrator("1.0.0");
    let chains = vec![ChainConfig::new(1)];

    let first = orchestrator.extract_all(&chains).await.unwrap();
    assert_eq!(
        first[0].outcome,
        ChainOutcome::Extracted {
            source: ExtractorKind::File,
            events: 3
        }
    );
    let stat_after_first = harness.stats.get(1).await.unwrap().unwrap();
    assert!(stat_after_first.success);
    assert_eq!(stat_after_first.source, Some(ExtractorKind::File));
    assert_eq!(stat_after_first.last_block, 102);

    let second = orchestrator.extract_all(&chains).await.unwrap();
    assert_eq!(second[0].outcome, ChainOutcome::Cached);
    assert_eq!(harness.file.calls(), 1, "cached chain must not be re-extracted");
    assert_eq!(harness.events.count_by_chain(1).await.unwrap(), 3);
    assert_eq!(harness.stats.get(1).await.unwrap().unwrap(), stat_after_first);
}

#[tokio::test]
async fn test_version_change_invalidates_every_chain() {
    let harness = Harness::new(Script::Events(2), Script::Events(0), Script::Events(0));
    let chains = vec![ChainConfig::new(1), ChainConfig::new(2)];

    harness.orchestrator("1.0.0").extract_all(&chains).await.unwrap();
    assert_eq!(harness.file.calls(), 2);

    let reports = harness.orchestrator("1.1.0").extract_all(&chains).await.unwrap();
    assert!(reports
        .iter()
        .all(|r| matches!(r.outcome, ChainOutcome::Extracted { .. })));
    assert_eq!(harness.file.calls(), 4);
    for chain_id in [1, 2] {
        let stat = harness.stats.get(chain_id).await.unwrap().unwrap();
        assert_eq!(stat.version, "1.1.0");
        assert_eq!(harness.events.count_by_chain(chain_id).await.unwrap(), 2);
    }
}

#[tokio::test]
async fn test_sources_are_tried_in_order() {
    let harness = Harness::new(Script::Events(0), Script::Fail("indexer down"), Script::Events(4));
    let reports = harness
        .orchestrator("1.0.0")
        .extract_all(&[full_chain(1)])
        .await
        .unwrap();

    assert_eq!(
        reports[0].outcome,
        ChainOutcome::Extracted {
            source: ExtractorKind::Rpc,
            events: 4
        }
    );
    assert_eq!(harness.file.calls(), 1);
    assert_eq!(harness.graphql.calls(), 1);
    assert_eq!(harness.rpc.calls(), 1);
}

#[tokio::test]
async fn test_unconfigured_sources_are_not_tried() {
    let harness = Harness::new(Script::Events(0), Script::Events(5), Script::Events(5));
    let reports = harness
        .orchestrator("1.0.0")
        .extract_all(&[ChainConfig::new(1)])
        .await
        .unwrap();

    assert!(matches!(reports[0].outcome, ChainOutcome::Failed { .. }));
    assert_eq!(harness.graphql.calls(), 0);
    assert_eq!(harness.rpc.calls(), 0);
    let stat = harness.stats.get(1).await.unwrap().unwrap();
    assert!(!stat.success);
    assert_eq!(stat.source, Some(ExtractorKind::File));
}

#[tokio::test]
async fn test_failed_stat_names_last_source_tried() {
    let harness = Harness::new(Script::Events(0), Script::Events(0), Script::Fail("node unreachable"));
    let reports = harness
        .orchestrator("1.0.0")
        .extract_all(&[full_chain(1)])
        .await
        .unwrap();

    match &reports[0].outcome {
        ChainOutcome::Failed { reason } => assert!(reason.contains("node unreachable"), "{}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    let stat = harness.stats.get(1).await.unwrap().unwrap();
    assert_eq!(stat.source, Some(ExtractorKind::Rpc));
}

#[tokio::test]
async fn test_rejected_batch_leaves_no_events() {
    let harness = Harness::new(Script::Events(3), Script::Events(0), Script::Events(0));
    let poisoned = transfer(1, 2);
    harness.events.poison_id(poisoned.id.clone()).await;

    let reports = harness
        .orchestrator("1.0.0")
        .extract_all(&[ChainConfig::new(1)])
        .await
        .unwrap();

    match &reports[0].outcome {
        ChainOutcome::Failed { reason } => assert!(reason.contains("chain 1"), "{}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(harness.events.count_by_chain(1).await.unwrap(), 0);
    let stat = harness.stats.get(1).await.unwrap().unwrap();
    assert!(!stat.success);
    assert_eq!(stat.source, Some(ExtractorKind::File));
}

#[tokio::test]
async fn test_failed_chain_does_not_affect_others() {
    let harness = Harness::new(Script::Events(2), Script::Events(0), Script::Events(0));
    harness.events.poison_id(transfer(2, 0).id).await;

    let reports = harness
        .orchestrator("1.0.0")
        .extract_all(&[ChainConfig::new(1), ChainConfig::new(2)])
        .await
        .unwrap();

    assert!(matches!(reports[0].outcome, ChainOutcome::Extracted { .. }));
    assert!(matches!(reports[1].outcome, ChainOutcome::Failed { .. }));
    assert_eq!(harness.events.count_by_chain(1).await.unwrap(), 2);
}

#[tokio::test]
async fn test_unreachable_store_aborts_the_run() {
    let harness = Harness::new(Script::Events(1), Script::Events(0), Script::Events(0));
    harness.events.set_offline(true);

    let result = harness
        .orchestrator("1.0.0")
        .extract_all(&[ChainConfig::new(1)])
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_test_chains_are_skipped() {
    let harness = Harness::new(Script::Events(1), Script::Events(0), Script::Events(0));
    let reports = harness
        .orchestrator("1.0.0")
        .extract_all(&[ChainConfig::new(1337).with_test(true)])
        .await
        .unwrap();

    assert_eq!(reports[0].outcome, ChainOutcome::Skipped);
    assert_eq!(harness.file.calls(), 0);
    assert!(harness.stats.get(1337).await.unwrap().is_none());
}

/// Holds each call open for a while and records the peak number of overlapping calls.
struct SlowExtractor {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ChainExtractor for SlowExtractor {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::File
    }

    async fn extract(&self, chain: &ChainConfig) -> Result<Vec<ChainEvent>, ExtractionError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![transfer(chain.chain_id, 0)])
    }
}

async fn peak_concurrency(concurrency: usize, chains: u64) -> usize {
    let slow = Arc::new(SlowExtractor {
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let idle = ScriptedExtractor::new(ExtractorKind::Rpc, Script::Events(0));
    let factory = ExtractorFactory::new(slow.clone(), idle.clone(), idle);
    let orchestrator = ExtractionOrchestrator::new(
        factory,
        Arc::new(MemoryEventStore::new()),
        Arc::new(MemoryStatStore::new()),
        "1.0.0",
    )
    .with_concurrency(concurrency);

    let configs: Vec<_> = (1..=chains).map(ChainConfig::new).collect();
    let reports = orchestrator.extract_all(&configs).await.unwrap();
    assert!(reports
        .iter()
        .all(|r| matches!(r.outcome, ChainOutcome::Extracted { .. })));
    let order: Vec<u64> = reports.iter().map(|r| r.chain_id).collect();
    assert_eq!(order, (1..=chains).collect::<Vec<_>>());
    slow.peak.load(Ordering::SeqCst)
}

#[tokio::test]
async fn test_chains_run_concurrently_up_to_the_bound() {
    assert_eq!(peak_concurrency(2, 5).await, 2);
    assert_eq!(peak_concurrency(4, 4).await, 4);
}

#[tokio::test]
async fn test_concurrency_of_one_runs_chains_sequentially() {
    assert_eq!(peak_concurrency(1, 3).await, 1);
}
