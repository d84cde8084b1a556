//! Integration tests for the RPC source
//!
//! Tests cover:
//! - Per-call timeouts on log queries and the head block lookup
//! - Timeouts failing the window instead of splitting it
//!
//! The provider is an in-process `LogProvider` that stalls on request.

use async_trait::async_trait;
use ethers::types::{Address, Filter, Log};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use token_flow_sdk::error::{ExtractionError, ProviderError};
use token_flow_sdk::events::EventKind;
use token_flow_sdk::extractors::{LogProvider, RpcExtractor};
use token_flow_sdk::settings::ChainConfig;
use token_flow_sdk::ChainExtractor;

struct StallingProvider {
    head: u64,
    stall_head: bool,
    stall_logs: bool,
    log_calls: AtomicUsize,
}

impl StallingProvider {
    fn new(stall_head: bool, stall_logs: bool) -> Arc<Self> {
        Arc::new(Self {
            head: 500,
            stall_head,
            stall_logs,
            log_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LogProvider for StallingProvider {
    async fn block_number(&self) -> Result<u64, ProviderError> {
        if self.stall_head {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        Ok(self.head)
    }

    async fn logs(&self, _filter: &Filter) -> Result<Vec<Log>, ProviderError> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        if self.stall_logs {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        Ok(Vec::new())
    }
}

fn chain() -> ChainConfig {
    let mut signatures = HashMap::new();
    signatures.insert(EventKind::Transfer, "Transfer(address,address,uint256)".to_string());
    ChainConfig::new(10)
        .with_start_block(100)
        .with_token_contract(Address::repeat_byte(0x42))
        .with_event_signatures(signatures)
}

#[tokio::test]
async fn test_stalled_log_query_times_out_without_splitting() {
    let provider = StallingProvider::new(false, true);
    let extractor = RpcExtractor::new(Duration::from_millis(50)).with_provider(provider.clone());

    let err = extractor.extract(&chain()).await.unwrap_err();
    match &err {
        ExtractionError::Provider {
            from_block,
            to_block,
            source: ProviderError::Timeout(limit),
        } => {
            assert_eq!((*from_block, *to_block), (100, 500));
            assert_eq!(*limit, Duration::from_millis(50));
        }
        other => panic!("expected a provider timeout, got {:?}", other),
    }
    assert!(err.is_retryable());
    assert_eq!(provider.log_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stalled_head_lookup_times_out() {
    let provider = StallingProvider::new(true, false);
    let extractor = RpcExtractor::new(Duration::from_millis(50)).with_provider(provider.clone());

    let err = extractor.extract(&chain()).await.unwrap_err();
    assert!(matches!(
        err,
        ExtractionError::BlockNumber(ProviderError::Timeout(_))
    ));
    assert!(err.is_retryable());
    assert_eq!(provider.log_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_responsive_provider_completes_within_timeout() {
    let provider = StallingProvider::new(false, false);
    let extractor = RpcExtractor::new(Duration::from_millis(500)).with_provider(provider.clone());

    let events = extractor.extract(&chain()).await.unwrap();
    assert!(events.is_empty());
    assert_eq!(provider.log_calls.load(Ordering::SeqCst), 1);
}
