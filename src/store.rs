//! # Event and stat stores
//!
//! Two keyed stores back the orchestrator:
//!
//! - [`EventStore`]: events keyed by `(chain_id, id)`. Bulk inserts are atomic per batch.
//! - [`StatStore`]: one [`Stat`] per chain.
//!
//! Writes are always scoped by chain id, so concurrent chains never contend on the same keys.
//! [`MemoryEventStore`] / [`MemoryStatStore`] are process-local implementations; the PostgreSQL
//! implementation lives in [`crate::database`].

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::events::ChainEvent;
use crate::stats::Stat;

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn count_by_chain(&self, chain_id: u64) -> Result<usize, StoreError>;

    async fn exists_for_chain(&self, chain_id: u64) -> Result<bool, StoreError> {
        Ok(self.count_by_chain(chain_id).await? > 0)
    }

    /// Events of a chain in ascending `(block_number, log_index)` order.
    async fn get_by_chain(&self, chain_id: u64) -> Result<Vec<ChainEvent>, StoreError>;

    /// Upserts a batch by id. Either every event is written or none is.
    async fn insert_many(&self, chain_id: u64, events: &[ChainEvent]) -> Result<usize, StoreError>;

    async fn last_block_by_chain(&self, chain_id: u64) -> Result<Option<u64>, StoreError>;

    async fn clear_chain(&self, chain_id: u64) -> Result<(), StoreError>;

    async fn clear_all(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait StatStore: Send + Sync {
    async fn get(&self, chain_id: u64) -> Result<Option<Stat>, StoreError>;

    /// Returns the stored stat, creating a fresh one for `version` when the chain has none.
    async fn get_or_create(&self, chain_id: u64, version: &str) -> Result<Stat, StoreError>;

    async fn upsert(&self, stat: &Stat) -> Result<(), StoreError>;

    async fn clear_all(&self) -> Result<(), StoreError>;
}

/// Rejects batches that cannot be written as a whole.
pub(crate) fn validate_batch(chain_id: u64, events: &[ChainEvent]) -> Result<(), StoreError> {
    let reject = |reason: String| StoreError::Insert {
        chain_id,
        total: events.len(),
        reason,
    };
    for event in events {
        if event.id.trim().is_empty() {
            return Err(reject(format!(
                "event at block {} has an empty id",
                event.block_number
            )));
        }
        if event.chain_id != chain_id {
            return Err(reject(format!(
                "event {} belongs to chain {}",
                event.id, event.chain_id
            )));
        }
    }
    Ok(())
}

pub(crate) fn sort_events(events: &mut [ChainEvent]) {
    events.sort_by(|a, b| {
        (a.block_number, a.log_index, &a.id).cmp(&(b.block_number, b.log_index, &b.id))
    });
}

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    chains: RwLock<HashMap<u64, IndexMap<String, ChainEvent>>>,
    /// Simulates a store outage: every call fails with [`StoreError::Unavailable`].
    offline: AtomicBool,
    /// Ids whose insert is rejected, failing their whole batch.
    poisoned_ids: RwLock<HashSet<String>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Makes any batch containing `id` fail, for exercising atomic batch semantics.
    pub async fn poison_id(&self, id: impl Into<String>) {
        self.poisoned_ids.write().await.insert(id.into());
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn count_by_chain(&self, chain_id: u64) -> Result<usize, StoreError> {
        self.check_online()?;
        Ok(self
            .chains
            .read()
            .await
            .get(&chain_id)
            .map(|events| events.len())
            .unwrap_or(0))
    }

    async fn get_by_chain(&self, chain_id: u64) -> Result<Vec<ChainEvent>, StoreError> {
        self.check_online()?;
        let mut events: Vec<ChainEvent> = self
            .chains
            .read()
            .await
            .get(&chain_id)
            .map(|events| events.values().cloned().collect())
            .unwrap_or_default();
        sort_events(&mut events);
        Ok(events)
    }

    async fn insert_many(&self, chain_id: u64, events: &[ChainEvent]) -> Result<usize, StoreError> {
        self.check_online()?;
        validate_batch(chain_id, events)?;
        {
            let poisoned = self.poisoned_ids.read().await;
            if let Some(bad) = events.iter().find(|e| poisoned.contains(&e.id)) {
                return Err(StoreError::Insert {
                    chain_id,
                    total: events.len(),
                    reason: format!("document {} was rejected", bad.id),
                });
            }
        }

        let mut chains = self.chains.write().await;
        let stored = chains.entry(chain_id).or_default();
        for event in events {
            stored.insert(event.id.clone(), event.clone());
        }
        Ok(events.len())
    }

    async fn last_block_by_chain(&self, chain_id: u64) -> Result<Option<u64>, StoreError> {
        self.check_online()?;
        Ok(self
            .chains
            .read()
            .await
            .get(&chain_id)
            .and_then(|events| events.values().map(|e| e.block_number).max()))
    }

    async fn clear_chain(&self, chain_id: u64) -> Result<(), StoreError> {
        self.check_online()?;
        self.chains.write().await.remove(&chain_id);
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        self.check_online()?;
        self.chains.write().await.clear();
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStatStore {
    stats: Arc<DashMap<u64, Stat>>,
}

impl MemoryStatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

#[async_trait]
impl StatStore for MemoryStatStore {
    async fn get(&self, chain_id: u64) -> Result<Option<Stat>, StoreError> {
        Ok(self.stats.get(&chain_id).map(|s| s.value().clone()))
    }

    async fn get_or_create(&self, chain_id: u64, version: &str) -> Result<Stat, StoreError> {
        let entry = self
            .stats
            .entry(chain_id)
            .or_insert_with(|| Stat::new(chain_id, version));
        Ok(entry.value().clone())
    }

    async fn upsert(&self, stat: &Stat) -> Result<(), StoreError> {
        self.stats.insert(stat.chain_id, stat.clone());
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        self.stats.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventArgs, TransferArgs};
    use ethers::types::{Address, H256};

    fn event(chain_id: u64, block: u64, log_index: u64) -> ChainEvent {
        ChainEvent::new(
            chain_id,
            block,
            H256::from_low_u64_be(block),
            H256::from_low_u64_be(block * 10 + log_index),
            log_index,
            "Transfer(address,address,uint256)",
            EventArgs::Transfer(TransferArgs {
                from: Address::repeat_byte(1),
                to: Address::repeat_byte(2),
                amount: "1.0".to_string(),
            }),
        )
    }

    #[tokio::test]
    async fn test_insert_is_upsert_by_id() {
        let store = MemoryEventStore::new();
        let batch = vec![event(1, 5, 0), event(1, 3, 1)];
        store.insert_many(1, &batch).await.unwrap();
        store.insert_many(1, &batch).await.unwrap();
        assert_eq!(store.count_by_chain(1).await.unwrap(), 2);
        assert_eq!(store.last_block_by_chain(1).await.unwrap(), Some(5));

        let blocks: Vec<u64> = store.get_by_chain(1).await.unwrap().iter().map(|e| e.block_number).collect();
        assert_eq!(blocks, vec![3, 5]);
    }

    #[tokio::test]
    async fn test_rejected_batch_writes_nothing() {
        let store = MemoryEventStore::new();
        let mut batch = vec![event(1, 1, 0), event(1, 2, 0)];
        batch[1].id = String::new();
        let err = store.insert_many(1, &batch).await.unwrap_err();
        assert!(matches!(err, StoreError::Insert { total: 2, .. }));
        assert!(!store.exists_for_chain(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_chain_is_scoped() {
        let store = MemoryEventStore::new();
        store.insert_many(1, &[event(1, 1, 0)]).await.unwrap();
        store.insert_many(2, &[event(2, 1, 0)]).await.unwrap();
        store.clear_chain(1).await.unwrap();
        assert_eq!(store.count_by_chain(1).await.unwrap(), 0);
        assert_eq!(store.count_by_chain(2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_offline_store_is_unavailable() {
        let store = MemoryEventStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.count_by_chain(1).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_stat_get_or_create_keeps_existing() {
        let stats = MemoryStatStore::new();
        let created = stats.get_or_create(7, "1.0.0").await.unwrap();
        assert_eq!(created.version, "1.0.0");
        let again = stats.get_or_create(7, "2.0.0").await.unwrap();
        assert_eq!(again.version, "1.0.0");
        stats.clear_all().await.unwrap();
        assert!(stats.is_empty());
    }
}
