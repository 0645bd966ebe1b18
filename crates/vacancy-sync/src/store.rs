use async_trait::async_trait;
use chrono::NaiveDate;
use vacancy_core::{ListingPatch, ListingRecord, ListingRow};

use crate::FeedError;

/// Persisted listing table plus the table-wide watermark.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Creates the listing table and its indexes when missing.
    async fn ensure_schema(&self) -> Result<(), FeedError>;

    /// `max(added_at, updated_at, removed_at)` over the whole table, or
    /// 1970-01-01 when the table is empty. Snapshots dated on or before it
    /// are fully reconciled.
    async fn current_watermark(&self) -> Result<NaiveDate, FeedError>;

    /// Starts the unit of work for one snapshot date. Dropping the returned
    /// transaction without committing discards every change made through it.
    async fn begin(&self) -> Result<Box<dyn ListingTransaction>, FeedError>;
}

#[async_trait]
pub trait ListingTransaction: Send {
    async fn fetch(&mut self, id: i64) -> Result<Option<ListingRecord>, FeedError>;

    /// Inserts the populated columns of `row` with `added_at = updated_at = date`.
    async fn insert(&mut self, row: &ListingRow, date: NaiveDate) -> Result<(), FeedError>;

    async fn apply(&mut self, id: i64, patch: &ListingPatch) -> Result<(), FeedError>;

    /// `(id, removed_at)` of every listing added strictly before `before`.
    async fn removal_candidates(
        &mut self,
        before: NaiveDate,
    ) -> Result<Vec<(i64, Option<NaiveDate>)>, FeedError>;

    async fn mark_removed(&mut self, ids: &[i64], date: NaiveDate) -> Result<(), FeedError>;

    async fn commit(self: Box<Self>) -> Result<(), FeedError>;
}
