// Event extractors
// One ChainExtractor per source, selected through ExtractorFactory

pub mod file;
pub mod graphql;
pub mod rpc;

use std::sync::Arc;
use std::time::Duration;

pub use crate::extractor::{ChainExtractor, ExtractorKind};
pub use file::FileExtractor;
pub use graphql::GraphqlExtractor;
pub use rpc::{HttpLogProvider, LogProvider, RpcExtractor};

use crate::settings::Settings;

/// Lookup from [`ExtractorKind`] to its implementation.
///
/// Ordering between sources is the orchestrator's concern; the factory only hands them out.
#[derive(Clone)]
pub struct ExtractorFactory {
    file: Arc<dyn ChainExtractor>,
    graphql: Arc<dyn ChainExtractor>,
    rpc: Arc<dyn ChainExtractor>,
}

impl ExtractorFactory {
    pub fn new(
        file: Arc<dyn ChainExtractor>,
        graphql: Arc<dyn ChainExtractor>,
        rpc: Arc<dyn ChainExtractor>,
    ) -> Self {
        Self { file, graphql, rpc }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let timeout = Duration::from_secs(settings.extraction.rpc_timeout_secs);
        Self::new(
            Arc::new(FileExtractor::new()),
            Arc::new(GraphqlExtractor::new(
                timeout,
                settings.extraction.graphql_page_size,
            )),
            Arc::new(RpcExtractor::new(timeout).with_max_block_span(settings.extraction.max_block_span)),
        )
    }

    pub fn get(&self, kind: ExtractorKind) -> Arc<dyn ChainExtractor> {
        match kind {
            ExtractorKind::File => Arc::clone(&self.file),
            ExtractorKind::Graphql => Arc::clone(&self.graphql),
            ExtractorKind::Rpc => Arc::clone(&self.rpc),
        }
    }
}
