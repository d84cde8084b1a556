//! Block-range fetching with bisection.
//!
//! Providers cap how many logs (or how many blocks) a single `eth_getLogs` call may cover. When a
//! call is refused with a range error the window is split at its midpoint and both halves are
//! fetched, left first, until every leaf window succeeds. Results therefore come back in ascending
//! block order regardless of how often the range was split.
//!
//! The worklist is an explicit stack instead of recursion so very large ranges cannot grow the
//! call stack.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::{ExtractionError, ProviderError};

/// Bisecting fetcher over an opaque `query(from, to)` call.
#[derive(Debug, Clone, Default)]
pub struct RangeFetcher {
    call_timeout: Option<Duration>,
}

impl RangeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds each provider call. Expiry is reported as [`ProviderError::Timeout`], never bisected.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Fetches `[from_block, to_block]` (inclusive), splitting on range errors.
    ///
    /// A single-block window that still fails, or any non-range error, is returned as
    /// [`ExtractionError::Provider`] carrying the window that failed.
    pub async fn fetch<T, F, Fut>(
        &self,
        mut query: F,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<T>, ExtractionError>
    where
        F: FnMut(u64, u64) -> Fut,
        Fut: Future<Output = Result<Vec<T>, ProviderError>>,
    {
        let mut results = Vec::new();
        if from_block > to_block {
            return Ok(results);
        }

        // Right halves are pushed first so the left half is always popped next.
        let mut pending = vec![(from_block, to_block)];
        let mut splits = 0usize;
        while let Some((from, to)) = pending.pop() {
            match self.call(&mut query, from, to).await {
                Ok(mut logs) => results.append(&mut logs),
                Err(ProviderError::RangeTooLarge(reason)) if from < to => {
                    let mid = from + (to - from) / 2;
                    debug!(from_block = from, to_block = to, mid, %reason, "Bisecting block range");
                    pending.push((mid + 1, to));
                    pending.push((from, mid));
                    splits += 1;
                }
                Err(source) => {
                    return Err(ExtractionError::Provider {
                        from_block: from,
                        to_block: to,
                        source,
                    })
                }
            }
        }

        if splits > 0 {
            debug!(from_block, to_block, splits, "Range fetched after bisection");
        }
        Ok(results)
    }

    async fn call<T, F, Fut>(&self, query: &mut F, from: u64, to: u64) -> Result<Vec<T>, ProviderError>
    where
        F: FnMut(u64, u64) -> Fut,
        Fut: Future<Output = Result<Vec<T>, ProviderError>>,
    {
        match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, query(from, to)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(limit)),
            },
            None => query(from, to).await,
        }
    }
}
