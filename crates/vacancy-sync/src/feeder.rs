use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use vacancy_core::ReconcileCounts;
use vacancy_snapshot::SnapshotReader;
use vacancy_storage::{AuditLog, SnapshotDir, SnapshotStore};

use crate::{FeedError, FeederConfig, ListingStore, ReconciliationEngine, RetryPolicy};

/// One snapshot date committed by a pass.
#[derive(Debug, Clone, Serialize)]
pub struct FedSnapshot {
    pub date: NaiveDate,
    pub content_hash: String,
    pub counts: ReconcileCounts,
    pub audit_log: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub watermark_before: NaiveDate,
    pub fed: Vec<FedSnapshot>,
}

/// Drives the engine over every pending snapshot directory, oldest first,
/// one transaction per date.
pub struct Feeder<S> {
    store: S,
    snapshots: SnapshotStore,
    engine: ReconciliationEngine,
    recheck_every: Duration,
    retry: RetryPolicy,
}

impl<S: ListingStore> Feeder<S> {
    pub fn new(store: S, snapshots: SnapshotStore) -> Self {
        let retry = RetryPolicy::default();
        Self {
            store,
            snapshots,
            engine: ReconciliationEngine::default(),
            recheck_every: retry.base_delay,
            retry,
        }
    }

    pub fn from_config(store: S, config: &FeederConfig) -> Self {
        Self::new(store, SnapshotStore::new(config.data_dir.clone()))
            .with_schedule(config.recheck_every, config.retry)
    }

    pub fn with_engine(mut self, engine: ReconciliationEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_schedule(mut self, recheck_every: Duration, retry: RetryPolicy) -> Self {
        self.recheck_every = recheck_every;
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn current_watermark(&self) -> Result<NaiveDate, FeedError> {
        self.store.current_watermark().await
    }

    /// One pass over the snapshot store. Stops at the first date that fails;
    /// dates committed before it stay committed.
    pub async fn run_once(&self) -> Result<RunSummary, FeedError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("feed_run", %run_id);
        self.run_pass(run_id).instrument(span).await
    }

    async fn run_pass(&self, run_id: Uuid) -> Result<RunSummary, FeedError> {
        let started_at = Utc::now();

        self.store.ensure_schema().await?;
        let watermark_before = self.store.current_watermark().await?;
        let pending = self.snapshots.pending_after(watermark_before).await?;
        if !pending.is_empty() {
            info!(
                watermark = %watermark_before,
                pending = pending.len(),
                "found snapshots to feed"
            );
        }

        let mut fed = Vec::with_capacity(pending.len());
        for snapshot in &pending {
            fed.push(self.feed_snapshot(snapshot).await?);
        }

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            watermark_before,
            fed,
        })
    }

    async fn feed_snapshot(&self, snapshot: &SnapshotDir) -> Result<FedSnapshot, FeedError> {
        let content_hash = snapshot.content_hash().await?;
        info!(
            snapshot = %snapshot.path.display(),
            content_hash = %content_hash,
            "feeding snapshot"
        );

        let mut audit = AuditLog::create(snapshot.audit_log_path()).await?;
        let rows = SnapshotReader::open(snapshot.csv_path())
            .map_err(|source| FeedError::from_snapshot(snapshot.date, source))?;

        let mut tx = self.store.begin().await?;
        let outcome = self
            .engine
            .reconcile(tx.as_mut(), rows, snapshot.date, &mut audit)
            .await;
        let counts = settle(outcome, audit.flush().await)?;
        tx.commit().await?;

        info!(
            snapshot_date = %snapshot.date,
            added = counts.added,
            updated = counts.updated,
            removed = counts.removed,
            "snapshot committed"
        );
        Ok(FedSnapshot {
            date: snapshot.date,
            content_hash,
            counts,
            audit_log: audit.path().to_path_buf(),
        })
    }

    /// Polls forever. A failed pass is logged and retried from scratch; the
    /// watermark makes already committed dates drop out of the next pass.
    pub async fn run_forever(&self) {
        let mut consecutive_failures = 0u32;
        loop {
            let delay = match self.run_once().await {
                Ok(_) => {
                    consecutive_failures = 0;
                    self.recheck_every
                }
                Err(err) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let delay = self.retry.delay_after_failures(consecutive_failures);
                    error!(
                        error = %err,
                        kind = ?err.kind(),
                        consecutive_failures,
                        retry_in_secs = delay.as_secs(),
                        "feed run failed"
                    );
                    delay
                }
            };
            tokio::time::sleep(delay).await;
        }
    }
}

/// A failed reconciliation is reported over a failed audit flush, so the
/// failure keeps its kind.
fn settle(
    outcome: Result<ReconcileCounts, FeedError>,
    flushed: std::io::Result<()>,
) -> Result<ReconcileCounts, FeedError> {
    if let (Err(_), Err(flush_err)) = (&outcome, &flushed) {
        warn!(error = %flush_err, "flushing audit log failed");
    }
    let counts = outcome?;
    flushed?;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FailureKind;

    fn disk_full() -> std::io::Result<()> {
        Err(std::io::Error::other("no space left on device"))
    }

    #[test]
    fn reconcile_failure_wins_over_flush_failure() {
        let conflict = FeedError::Conflict {
            id: 1,
            snapshot_date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            updated_at: None,
        };
        let err = settle(Err(conflict), disk_full()).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Consistency);
    }

    #[test]
    fn flush_failure_fails_a_clean_reconcile() {
        let err = settle(Ok(ReconcileCounts::default()), disk_full()).unwrap_err();
        assert!(matches!(err, FeedError::Audit(_)));
        assert_eq!(err.kind(), FailureKind::Transient);

        let counts = ReconcileCounts {
            added: 2,
            updated: 0,
            removed: 1,
        };
        assert_eq!(settle(Ok(counts), Ok(())).unwrap(), counts);
    }
}
