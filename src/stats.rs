use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extractor::ExtractorKind;

/// Per-chain extraction record. One per chain, overwritten by every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stat {
    pub chain_id: u64,
    /// Application version that produced the stored events.
    pub version: String,
    pub last_extracted_at: DateTime<Utc>,
    pub success: bool,
    pub source: Option<ExtractorKind>,
    pub last_block: u64,
}

impl Stat {
    /// Fresh stat for a chain that has not been extracted under `version` yet.
    pub fn new(chain_id: u64, version: impl Into<String>) -> Self {
        Self {
            chain_id,
            version: version.into(),
            last_extracted_at: Utc::now(),
            success: false,
            source: None,
            last_block: 0,
        }
    }

    pub fn record_success(&mut self, source: ExtractorKind, last_block: u64) {
        self.last_extracted_at = Utc::now();
        self.success = true;
        self.source = Some(source);
        self.last_block = last_block;
    }

    /// `last_tried` is the source attempted last, `None` when none was reached.
    pub fn record_failure(&mut self, last_tried: Option<ExtractorKind>) {
        self.last_extracted_at = Utc::now();
        self.success = false;
        self.source = last_tried;
        self.last_block = 0;
    }
}
