//! In-memory (single process) implementations of the record stores for local
//! development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use waybill_records::{
    ChannelBinding, ChannelBindings, ItemKey, MilestoneRecord, MilestoneRecords,
};

/// In-memory milestone record store.
#[derive(Clone, Default)]
pub struct MemoryRecords {
    rows: Arc<Mutex<Vec<MilestoneRecord>>>,
}

impl MemoryRecords {
    /// Creates a new `MemoryRecords`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl MilestoneRecords for MemoryRecords {
    type Error = Error;

    async fn create(&self, record: MilestoneRecord) -> Result<MilestoneRecord, Self::Error> {
        self.rows.lock().await.push(record.clone());
        Ok(record)
    }

    async fn find_many(&self, item: &ItemKey) -> Result<Vec<MilestoneRecord>, Self::Error> {
        let rows = self.rows.lock().await;
        let mut matched: Vec<MilestoneRecord> =
            rows.iter().filter(|r| &r.item == item).cloned().collect();
        matched.sort_by_key(|r| r.created_at);
        Ok(matched)
    }

    async fn find_latest(&self, item: &ItemKey) -> Result<Option<MilestoneRecord>, Self::Error> {
        Ok(self.find_many(item).await?.into_iter().next_back())
    }
}

/// In-memory channel binding store.
#[derive(Clone, Default)]
pub struct MemoryBindings {
    rows: Arc<Mutex<HashMap<String, ChannelBinding>>>,
}

impl MemoryBindings {
    /// Creates a new `MemoryBindings`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl ChannelBindings for MemoryBindings {
    type Error = Error;

    async fn create(&self, binding: ChannelBinding) -> Result<ChannelBinding, Self::Error> {
        self.rows
            .lock()
            .await
            .insert(binding.item_key.clone(), binding.clone());
        Ok(binding)
    }

    async fn find_by_item_key(
        &self,
        item_key: &str,
    ) -> Result<Option<ChannelBinding>, Self::Error> {
        Ok(self.rows.lock().await.get(item_key).cloned())
    }

    async fn deactivate(&self, item_key: &str) -> Result<(), Self::Error> {
        let mut rows = self.rows.lock().await;
        let binding = rows
            .get_mut(item_key)
            .ok_or_else(|| Error::NotFound(item_key.to_string()))?;
        binding.is_active = false;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<ChannelBinding>, Self::Error> {
        let rows = self.rows.lock().await;
        Ok(rows.values().filter(|b| b.is_active).cloned().collect())
    }
}
