use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Mutex;
use vacancy_core::{empty_watermark, ListingPatch, ListingRecord, ListingRow};

use crate::{FeedError, ListingStore, ListingTransaction};

/// In-process listing table. Transactions work on a private copy that
/// replaces the shared map on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryListingStore {
    records: Arc<Mutex<BTreeMap<i64, ListingRecord>>>,
}

impl MemoryListingStore {
    pub async fn get(&self, id: i64) -> Option<ListingRecord> {
        self.records.lock().await.get(&id).cloned()
    }

    pub async fn records(&self) -> Vec<ListingRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    /// Stores `record` as-is, bypassing reconciliation.
    pub async fn seed(&self, record: ListingRecord) {
        self.records.lock().await.insert(record.id, record);
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn ensure_schema(&self) -> Result<(), FeedError> {
        Ok(())
    }

    async fn current_watermark(&self) -> Result<NaiveDate, FeedError> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter_map(ListingRecord::watermark)
            .max()
            .unwrap_or_else(empty_watermark))
    }

    async fn begin(&self) -> Result<Box<dyn ListingTransaction>, FeedError> {
        let staged = self.records.lock().await.clone();
        Ok(Box::new(MemoryTransaction {
            staged,
            target: Arc::clone(&self.records),
        }))
    }
}

struct MemoryTransaction {
    staged: BTreeMap<i64, ListingRecord>,
    target: Arc<Mutex<BTreeMap<i64, ListingRecord>>>,
}

#[async_trait]
impl ListingTransaction for MemoryTransaction {
    async fn fetch(&mut self, id: i64) -> Result<Option<ListingRecord>, FeedError> {
        Ok(self.staged.get(&id).cloned())
    }

    async fn insert(&mut self, row: &ListingRow, date: NaiveDate) -> Result<(), FeedError> {
        if self.staged.contains_key(&row.id) {
            return Err(anyhow!("listing {} already exists", row.id).into());
        }
        self.staged
            .insert(row.id, ListingRecord::first_seen(row, date));
        Ok(())
    }

    async fn apply(&mut self, id: i64, patch: &ListingPatch) -> Result<(), FeedError> {
        let record = self
            .staged
            .get_mut(&id)
            .ok_or_else(|| anyhow!("listing {id} does not exist"))?;
        record.apply(patch);
        Ok(())
    }

    async fn removal_candidates(
        &mut self,
        before: NaiveDate,
    ) -> Result<Vec<(i64, Option<NaiveDate>)>, FeedError> {
        Ok(self
            .staged
            .values()
            .filter(|record| record.added_at.is_some_and(|added_at| added_at < before))
            .map(|record| (record.id, record.removed_at))
            .collect())
    }

    async fn mark_removed(&mut self, ids: &[i64], date: NaiveDate) -> Result<(), FeedError> {
        for id in ids {
            let record = self
                .staged
                .get_mut(id)
                .ok_or_else(|| anyhow!("listing {id} does not exist"))?;
            record.removed_at = Some(date);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), FeedError> {
        let this = *self;
        *this.target.lock().await = this.staged;
        Ok(())
    }
}
