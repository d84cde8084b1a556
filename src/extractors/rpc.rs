// RPC Extractor - queries token and bridge contract logs over JSON-RPC
// Windows are split by RangeFetcher when the provider refuses them

use async_trait::async_trait;
use ethers::prelude::{Http, Middleware, Provider};
use ethers::types::{Address, Filter, Log, H256};
use ethers::utils::keccak256;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::block_range::RangeFetcher;
use crate::error::{ConfigError, ExtractionError, ProviderError};
use crate::events::{ChainEvent, EventKind};
use crate::extractor::{ChainExtractor, ExtractorKind};
use crate::metrics;
use crate::settings::ChainConfig;
use crate::utils::create_block_chunks;

/// Transfer goes first: a MINT/BURN mapped to the plain Transfer signature is then decoded with
/// the Transfer layout and classified by its void endpoint.
const QUERY_ORDER: [EventKind; 5] = [
    EventKind::Transfer,
    EventKind::Mint,
    EventKind::Burn,
    EventKind::BridgeStart,
    EventKind::BridgeEnd,
];

/// The two provider calls extraction needs.
#[async_trait]
pub trait LogProvider: Send + Sync {
    async fn block_number(&self) -> Result<u64, ProviderError>;

    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, ProviderError>;
}

/// [`LogProvider`] over an ethers HTTP provider. Error text is classified into range/transport.
pub struct HttpLogProvider {
    provider: Provider<Http>,
}

impl HttpLogProvider {
    pub fn connect(chain_id: u64, url: &str) -> Result<Self, ConfigError> {
        let provider = Provider::<Http>::try_from(url).map_err(|_| ConfigError::InvalidValue {
            chain_id,
            field: "rpc_url",
            value: url.to_string(),
        })?;
        Ok(Self { provider })
    }
}

#[async_trait]
impl LogProvider for HttpLogProvider {
    async fn block_number(&self) -> Result<u64, ProviderError> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| ProviderError::classify(e.to_string()))
    }

    async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, ProviderError> {
        self.provider
            .get_logs(filter)
            .await
            .map_err(|e| ProviderError::classify(e.to_string()))
    }
}

pub struct RpcExtractor {
    call_timeout: Duration,
    max_block_span: Option<u64>,
    /// Used instead of connecting to `chain.rpc_url` when set.
    provider: Option<Arc<dyn LogProvider>>,
}

impl RpcExtractor {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            call_timeout,
            max_block_span: None,
            provider: None,
        }
    }

    pub fn with_max_block_span(mut self, span: Option<u64>) -> Self {
        self.max_block_span = span.filter(|s| *s > 0);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn LogProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    fn provider_for(&self, chain: &ChainConfig) -> Result<Option<Arc<dyn LogProvider>>, ExtractionError> {
        if let Some(provider) = &self.provider {
            return Ok(Some(Arc::clone(provider)));
        }
        match chain.rpc_url.as_deref() {
            Some(url) => Ok(Some(Arc::new(HttpLogProvider::connect(chain.chain_id, url)?))),
            None => Ok(None),
        }
    }

    /// Contract address and filter for one event kind.
    fn filter_for(
        &self,
        chain: &ChainConfig,
        kind: EventKind,
        topic0: H256,
    ) -> Result<(Address, Filter), ConfigError> {
        let token = chain.token_contract_address;
        if kind.is_bridge() {
            let bridge = chain
                .bridge_contract_address
                .ok_or(ConfigError::MissingField {
                    chain_id: chain.chain_id,
                    field: "bridge_contract_address",
                })?;
            // Bridge events index the token as their first argument.
            let filter = Filter::new()
                .address(bridge)
                .topic0(topic0)
                .topic1(H256::from(token));
            Ok((bridge, filter))
        } else {
            Ok((token, Filter::new().address(token).topic0(topic0)))
        }
    }

    async fn fetch_kind(
        &self,
        provider: &Arc<dyn LogProvider>,
        chain: &ChainConfig,
        kind: EventKind,
        signature: &str,
        base: &Filter,
        windows: &[(u64, u64)],
    ) -> Result<Vec<ChainEvent>, ExtractionError> {
        let fetcher = RangeFetcher::new().with_call_timeout(self.call_timeout);
        let mut events = Vec::new();
        for &(from, to) in windows {
            let logs = fetcher
                .fetch(
                    |f, t| {
                        let provider = Arc::clone(provider);
                        let filter = base.clone().from_block(f).to_block(t);
                        async move { provider.logs(&filter).await }
                    },
                    from,
                    to,
                )
                .await?;
            for log in &logs {
                events.push(ChainEvent::from_log(chain.chain_id, kind, signature, log)?);
            }
        }
        debug!(
            chain_id = chain.chain_id,
            kind = %kind,
            events = events.len(),
            "Fetched logs for event kind"
        );
        Ok(events)
    }
}

#[async_trait]
impl ChainExtractor for RpcExtractor {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::Rpc
    }

    async fn extract(&self, chain: &ChainConfig) -> Result<Vec<ChainEvent>, ExtractionError> {
        let Some(provider) = self.provider_for(chain)? else {
            debug!(chain_id = chain.chain_id, "No RPC endpoint configured");
            return Ok(Vec::new());
        };
        let started = Instant::now();

        let latest = match tokio::time::timeout(self.call_timeout, provider.block_number()).await {
            Ok(result) => result.map_err(ExtractionError::BlockNumber)?,
            Err(_) => return Err(ExtractionError::BlockNumber(ProviderError::Timeout(self.call_timeout))),
        };
        if chain.start_block > latest {
            info!(
                chain_id = chain.chain_id,
                start_block = chain.start_block,
                latest,
                "Start block is ahead of the chain head"
            );
            return Ok(Vec::new());
        }

        let windows = match self.max_block_span {
            Some(span) => create_block_chunks(chain.start_block, latest, span),
            None => vec![(chain.start_block, latest)],
        };

        let mut queried: HashSet<(Address, H256)> = HashSet::new();
        let mut events = Vec::new();
        for kind in QUERY_ORDER {
            let Some(signature) = chain.signature_for(kind) else {
                info!(chain_id = chain.chain_id, kind = %kind, "No signature configured, skipping");
                continue;
            };
            let topic0 = H256::from(keccak256(signature.as_bytes()));
            let (address, base) = self.filter_for(chain, kind, topic0)?;
            // Two kinds mapped to the same signature would return the same logs twice.
            if !queried.insert((address, topic0)) {
                debug!(chain_id = chain.chain_id, kind = %kind, "Signature already queried");
                continue;
            }
            let mut kind_events = self
                .fetch_kind(&provider, chain, kind, signature, &base, &windows)
                .await?;
            events.append(&mut kind_events);
        }

        metrics::record_extraction(ExtractorKind::Rpc, events.len(), started.elapsed());
        info!(
            chain_id = chain.chain_id,
            from_block = chain.start_block,
            to_block = latest,
            events = events.len(),
            "RPC extraction finished"
        );
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Bytes, ValueOrArray, U256, U64};
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::Mutex;

    /// Serves logs at fixed blocks and refuses windows wider than `max_span`.
    struct ScriptedProvider {
        head: u64,
        max_span: u64,
        logs: Vec<Log>,
        calls: Mutex<Vec<(u64, u64)>>,
    }

    fn block_of(filter: &Filter, end: bool) -> u64 {
        let block = if end {
            filter.get_to_block()
        } else {
            filter.get_from_block()
        };
        block.map(|b| b.as_u64()).unwrap_or_default()
    }

    #[async_trait]
    impl LogProvider for ScriptedProvider {
        async fn block_number(&self) -> Result<u64, ProviderError> {
            Ok(self.head)
        }

        async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, ProviderError> {
            let from = block_of(filter, false);
            let to = block_of(filter, true);
            self.calls.lock().unwrap().push((from, to));
            if to - from + 1 > self.max_span {
                return Err(ProviderError::RangeTooLarge("query returned more than 10000 results".into()));
            }
            let topic0 = match &filter.topics[0] {
                Some(ValueOrArray::Value(Some(t))) => *t,
                _ => H256::zero(),
            };
            Ok(self
                .logs
                .iter()
                .filter(|l| l.topics[0] == topic0)
                .filter(|l| {
                    let n = l.block_number.unwrap().as_u64();
                    n >= from && n <= to
                })
                .cloned()
                .collect())
        }
    }

    fn transfer_log(block: u64, from: Address, to: Address) -> Log {
        let mut word = [0u8; 32];
        U256::exp10(18).to_big_endian(&mut word);
        Log {
            topics: vec![
                H256::from(keccak256("Transfer(address,address,uint256)".as_bytes())),
                H256::from(from),
                H256::from(to),
            ],
            data: Bytes::from(word.to_vec()),
            block_number: Some(U64::from(block)),
            block_hash: Some(H256::from_low_u64_be(block)),
            transaction_hash: Some(H256::from_low_u64_be(block * 1000)),
            log_index: Some(U256::zero()),
            ..Default::default()
        }
    }

    fn chain() -> ChainConfig {
        let mut signatures = HashMap::new();
        signatures.insert(EventKind::Transfer, "Transfer(address,address,uint256)".to_string());
        ChainConfig::new(10)
            .with_rpc_url("http://localhost:8545")
            .with_start_block(100)
            .with_token_contract(Address::from_str("0x4200000000000000000000000000000000000042").unwrap())
            .with_event_signatures(signatures)
    }

    #[tokio::test]
    async fn test_extract_bisects_and_keeps_block_order() {
        let a = Address::repeat_byte(0x0a);
        let b = Address::repeat_byte(0x0b);
        let provider = Arc::new(ScriptedProvider {
            head: 163,
            max_span: 16,
            logs: vec![transfer_log(101, a, b), transfer_log(150, b, a), transfer_log(163, a, Address::zero())],
            calls: Mutex::new(Vec::new()),
        });
        let extractor = RpcExtractor::new(Duration::from_secs(5)).with_provider(provider.clone());

        let events = extractor.extract(&chain()).await.unwrap();
        let blocks: Vec<u64> = events.iter().map(|e| e.block_number).collect();
        assert_eq!(blocks, vec![101, 150, 163]);
        assert_eq!(events[2].kind, EventKind::Burn);
        assert_eq!(provider.calls.lock().unwrap()[0], (100, 163));
    }

    #[tokio::test]
    async fn test_extract_pre_chunks_with_max_block_span() {
        let provider = Arc::new(ScriptedProvider {
            head: 129,
            max_span: 1000,
            logs: vec![],
            calls: Mutex::new(Vec::new()),
        });
        let extractor = RpcExtractor::new(Duration::from_secs(5))
            .with_max_block_span(Some(10))
            .with_provider(provider.clone());

        extractor.extract(&chain()).await.unwrap();
        assert_eq!(provider.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_bridge_kind_without_bridge_contract_is_config_error() {
        let mut signatures = HashMap::new();
        signatures.insert(EventKind::BridgeStart, "TokensBridgingInitiated(address,address,uint256,bytes32)".to_string());
        let chain = chain().with_event_signatures(signatures);
        let provider = Arc::new(ScriptedProvider {
            head: 200,
            max_span: 1000,
            logs: vec![],
            calls: Mutex::new(Vec::new()),
        });
        let err = RpcExtractor::new(Duration::from_secs(5))
            .with_provider(provider)
            .extract(&chain)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Config(ConfigError::MissingField { .. })));
    }

    #[tokio::test]
    async fn test_no_rpc_url_yields_nothing() {
        let chain = ChainConfig::new(3);
        let events = RpcExtractor::new(Duration::from_secs(1)).extract(&chain).await.unwrap();
        assert!(events.is_empty());
    }
}
