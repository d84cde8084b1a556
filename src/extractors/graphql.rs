// GraphQL Extractor - pages through an indexer's transaction list
// Each nested transfer row becomes one transfer ChainEvent

use async_trait::async_trait;
use ethers::types::{Address, H256};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{ExtractionError, ParseError};
use crate::events::{parse_amount, ChainEvent, EventArgs, EventKind, TransferArgs};
use crate::extractor::{ChainExtractor, ExtractorKind};
use crate::metrics;
use crate::settings::ChainConfig;
use crate::utils::deserialize_lenient_u64;

const TRANSFER_SIGNATURE: &str = "Transfer(address,address,uint256)";

const TRANSACTIONS_QUERY: &str = r#"
query Transactions($first: Int!, $skip: Int!, $startBlock: BigInt!) {
  transactions(
    first: $first
    skip: $skip
    orderBy: blockNumber
    orderDirection: asc
    where: { blockNumber_gte: $startBlock }
  ) {
    id
    blockNumber
    blockHash
    transfers {
      logIndex
      from
      to
      value
      tokenType
    }
  }
}
"#;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedTransaction {
    /// Transaction hash.
    pub id: H256,
    #[serde(deserialize_with = "deserialize_lenient_u64")]
    pub block_number: u64,
    #[serde(default)]
    pub block_hash: Option<H256>,
    #[serde(default)]
    pub transfers: Vec<IndexedTransfer>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedTransfer {
    #[serde(default)]
    pub log_index: Option<Value>,
    pub from: Address,
    pub to: Address,
    pub value: Value,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Unwraps a `{data}` / `{error}` / `{errors}` envelope into the page's transactions.
pub fn parse_page(body: Value) -> Result<Vec<IndexedTransaction>, ExtractionError> {
    let Value::Object(mut envelope) = body else {
        return Err(ParseError::Protocol("response is not an object".to_string()).into());
    };
    if let Some(error) = envelope.get("errors").or_else(|| envelope.get("error")) {
        if !error.is_null() {
            return Err(ExtractionError::Indexer(error.to_string()));
        }
    }
    let Some(mut data) = envelope.remove("data") else {
        return Err(ParseError::Protocol("expected a data or error field".to_string()).into());
    };
    let transactions = data
        .get_mut("transactions")
        .map(Value::take)
        .ok_or_else(|| ParseError::Protocol("data has no transactions field".to_string()))?;
    if !transactions.is_array() {
        return Err(ParseError::Protocol("transactions is not a list".to_string()).into());
    }
    serde_json::from_value(transactions).map_err(|e| ParseError::Protocol(e.to_string()).into())
}

/// Maps a page to transfer events, keeping only `token_type` rows when a filter is set.
pub fn transfers_to_events(
    chain: &ChainConfig,
    transactions: Vec<IndexedTransaction>,
) -> Result<Vec<ChainEvent>, ParseError> {
    let signature = chain
        .signature_for(EventKind::Transfer)
        .unwrap_or(TRANSFER_SIGNATURE)
        .to_string();
    let wanted = chain.graphql_token_type.as_deref();

    let mut events = Vec::new();
    for tx in transactions {
        for (position, transfer) in tx.transfers.into_iter().enumerate() {
            if let Some(wanted) = wanted {
                let matches = transfer
                    .token_type
                    .as_deref()
                    .map(|t| t.eq_ignore_ascii_case(wanted))
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }
            let log_index = match &transfer.log_index {
                Some(Value::Number(n)) => n.as_u64(),
                Some(Value::String(s)) => crate::utils::parse_u64(s),
                _ => None,
            }
            .unwrap_or(position as u64);
            let amount = parse_amount(&transfer.value)?;
            events.push(ChainEvent::new(
                chain.chain_id,
                tx.block_number,
                tx.block_hash.unwrap_or_default(),
                tx.id,
                log_index,
                signature.clone(),
                EventArgs::Transfer(TransferArgs {
                    from: transfer.from,
                    to: transfer.to,
                    amount,
                }),
            ));
        }
    }
    Ok(events)
}

pub struct GraphqlExtractor {
    client: reqwest::Client,
    page_size: usize,
}

impl GraphqlExtractor {
    pub fn new(timeout: Duration, page_size: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            page_size: page_size.max(1),
        }
    }

    async fn fetch_page(
        &self,
        url: &str,
        skip: usize,
        start_block: u64,
    ) -> Result<Vec<IndexedTransaction>, ExtractionError> {
        let body = json!({
            "query": TRANSACTIONS_QUERY,
            "variables": {
                "first": self.page_size,
                "skip": skip,
                "startBlock": start_block.to_string(),
            }
        });
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExtractionError::Http(e.to_string()))?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ExtractionError::Http(format!("{} ({})", e, status)))?;
        parse_page(payload)
    }
}

#[async_trait]
impl ChainExtractor for GraphqlExtractor {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::Graphql
    }

    async fn extract(&self, chain: &ChainConfig) -> Result<Vec<ChainEvent>, ExtractionError> {
        let Some(url) = chain.graph_url.as_deref() else {
            debug!(chain_id = chain.chain_id, "No indexer endpoint configured");
            return Ok(Vec::new());
        };
        let started = Instant::now();

        let mut events = Vec::new();
        let mut skip = 0usize;
        loop {
            let page = self.fetch_page(url, skip, chain.start_block).await?;
            let page_len = page.len();
            events.extend(transfers_to_events(chain, page)?);
            debug!(chain_id = chain.chain_id, skip, page_len, "Fetched indexer page");
            if page_len < self.page_size {
                break;
            }
            skip += page_len;
        }

        metrics::record_extraction(ExtractorKind::Graphql, events.len(), started.elapsed());
        info!(chain_id = chain.chain_id, events = events.len(), "Indexer extraction finished");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(token_type: &str) -> Value {
        json!({
            "id": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "blockNumber": "42",
            "transfers": [
                {"logIndex": "3", "from": "0x0000000000000000000000000000000000000000",
                 "to": "0x2222222222222222222222222222222222222222",
                 "value": "2500000000000000000", "tokenType": token_type}
            ]
        })
    }

    #[test]
    fn test_parse_page_data_envelope() {
        let page = parse_page(json!({"data": {"transactions": [tx("ERC-20")]}})).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].block_number, 42);
    }

    #[test]
    fn test_parse_page_error_envelopes() {
        let err = parse_page(json!({"errors": [{"message": "indexer down"}]})).unwrap_err();
        assert!(matches!(err, ExtractionError::Indexer(_)));
        let err = parse_page(json!({"error": "bad query"})).unwrap_err();
        assert!(matches!(err, ExtractionError::Indexer(_)));
    }

    #[test]
    fn test_parse_page_other_shape_is_protocol_error() {
        let err = parse_page(json!({"result": []})).unwrap_err();
        assert!(matches!(err, ExtractionError::Parse(ParseError::Protocol(_))));
        let err = parse_page(json!([1, 2])).unwrap_err();
        assert!(matches!(err, ExtractionError::Parse(ParseError::Protocol(_))));
    }

    #[test]
    fn test_token_type_filter() {
        let page = parse_page(json!({"data": {"transactions": [tx("ERC-20"), tx("ERC-721")]}})).unwrap();
        let chain = ChainConfig::new(100).with_graphql_token_type("erc-20");
        let events = transfers_to_events(&chain, page).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Mint);
        assert_eq!(events[0].log_index, 3);
        assert_eq!(events[0].transfer().unwrap().amount, "2.5");
    }

    #[test]
    fn test_no_filter_keeps_every_transfer() {
        let page = parse_page(json!({"data": {"transactions": [tx("ERC-20"), tx("ERC-721")]}})).unwrap();
        let events = transfers_to_events(&ChainConfig::new(100), page).unwrap();
        assert_eq!(events.len(), 2);
    }
}
