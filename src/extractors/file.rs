// File Extractor - reads a JSON array of raw logs exported for a chain
// Each record is classified through the chain's signature map

use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ExtractionError, ParseError};
use crate::events::{ChainEvent, RawLog};
use crate::extractor::{ChainExtractor, ExtractorKind};
use crate::settings::ChainConfig;

#[derive(Debug, Clone, Default)]
pub struct FileExtractor {
    /// Relative `local_events_path` values resolve against this directory.
    base_dir: Option<PathBuf>,
}

impl FileExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Decodes a file payload. Anything but a top-level array is a [`ParseError::NotAnArray`].
pub fn parse_events(
    source: &str,
    payload: &[u8],
    chain: &ChainConfig,
) -> Result<Vec<ChainEvent>, ParseError> {
    let value: Value = serde_json::from_slice(payload)?;
    let records = match value {
        Value::Array(records) => records,
        _ => return Err(ParseError::NotAnArray(source.to_string())),
    };

    let mut events = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        let raw: RawLog = serde_json::from_value(record).map_err(|e| ParseError::InvalidRecord {
            index,
            reason: e.to_string(),
        })?;
        let event = ChainEvent::from_raw(raw, chain).map_err(|e| ParseError::InvalidRecord {
            index,
            reason: e.to_string(),
        })?;
        events.push(event);
    }
    Ok(events)
}

#[async_trait]
impl ChainExtractor for FileExtractor {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::File
    }

    async fn extract(&self, chain: &ChainConfig) -> Result<Vec<ChainEvent>, ExtractionError> {
        let Some(configured) = chain.local_events_path.as_deref() else {
            debug!(chain_id = chain.chain_id, "No local events file configured");
            return Ok(Vec::new());
        };
        let path = self.resolve(configured);
        let shown = path.display().to_string();

        let payload = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(chain_id = chain.chain_id, path = %shown, "Local events file not found");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(ExtractionError::Io {
                    path: shown,
                    source,
                })
            }
        };

        let events = parse_events(&shown, &payload, chain)?;
        info!(
            chain_id = chain.chain_id,
            path = %shown,
            events = events.len(),
            "Loaded events from file"
        );
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::collections::HashMap;

    fn chain() -> ChainConfig {
        let mut signatures = HashMap::new();
        signatures.insert(EventKind::Transfer, "Transfer(address,address,uint256)".to_string());
        ChainConfig::new(1).with_event_signatures(signatures)
    }

    #[test]
    fn test_parse_events_rejects_object_payload() {
        let err = parse_events("events.json", br#"{"events": []}"#, &chain()).unwrap_err();
        assert!(matches!(err, ParseError::NotAnArray(_)));
    }

    #[test]
    fn test_parse_events_reports_bad_record_index() {
        let payload = br#"[
            {"eventSignature": "Transfer(address,address,uint256)", "blockNumber": 1,
             "blockHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
             "transactionHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
             "logIndex": 0,
             "args": ["0x1111111111111111111111111111111111111111", "0x2222222222222222222222222222222222222222", "1000"]},
            {"eventSignature": "Transfer(address,address,uint256)", "blockNumber": "0x2"}
        ]"#;
        let err = parse_events("events.json", payload, &chain()).unwrap_err();
        assert!(matches!(err, ParseError::InvalidRecord { index: 1, .. }));
    }

    #[tokio::test]
    async fn test_missing_path_yields_no_events() {
        let events = FileExtractor::new().extract(&chain()).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_configured_but_absent_file_yields_no_events() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain().with_local_events_path("absent.json");
        let events = FileExtractor::new()
            .with_base_dir(dir.path())
            .extract(&chain)
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_directory_path_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain().with_local_events_path(dir.path().to_str().unwrap());
        let err = FileExtractor::new().extract(&chain).await.unwrap_err();
        match err {
            ExtractionError::Io { path, .. } => assert_eq!(path, dir.path().display().to_string()),
            other => panic!("expected io error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relative_path_resolves_against_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("events.json"),
            br#"[{"eventSignature": "Transfer(address,address,uint256)", "blockNumber": 9,
                 "blockHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
                 "transactionHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
                 "logIndex": 1,
                 "args": ["0x1111111111111111111111111111111111111111", "0x0000000000000000000000000000000000000000", "7"]}]"#,
        )
        .unwrap();
        let chain = chain().with_local_events_path("events.json");
        let events = FileExtractor::new()
            .with_base_dir(dir.path())
            .extract(&chain)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Burn);
    }
}
