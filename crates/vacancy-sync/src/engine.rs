use std::collections::HashSet;

use chrono::NaiveDate;
use tracing::{error, info};
use vacancy_core::{
    cut_text, render, render_or_null, AuditSink, ColumnSpec, FieldValue, ListingPatch,
    ListingRecord, ListingRow, ReconcileCounts, ADDED_AT_COLUMN,
};
use vacancy_snapshot::NormalizeError;

use crate::{FeedError, ListingTransaction};

/// Rows between two progress log lines.
pub const STATS_EVERY: usize = 1000;

const AUDIT_VALUE_LIMIT: usize = 128;

/// Columns of `row` whose rendered value differs from `existing`.
pub fn diff_fields(
    row: &ListingRow,
    existing: &ListingRecord,
) -> Vec<(&'static ColumnSpec, Option<FieldValue>)> {
    row.fields
        .iter()
        .filter(|(spec, value)| render(value.as_ref()) != render(existing.field(spec.name)))
        .cloned()
        .collect()
}

/// Applies one snapshot date to the listing table.
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    stats_every: usize,
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new(STATS_EVERY)
    }
}

impl ReconciliationEngine {
    pub fn new(stats_every: usize) -> Self {
        Self {
            stats_every: stats_every.max(1),
        }
    }

    /// Inserts unseen ids, updates changed ones and flags the ones missing
    /// from the snapshot as removed. Any error leaves `tx` uncommitted and
    /// must be treated as a failure of the whole date.
    pub async fn reconcile<I>(
        &self,
        tx: &mut dyn ListingTransaction,
        rows: I,
        snapshot_date: NaiveDate,
        audit: &mut dyn AuditSink,
    ) -> Result<ReconcileCounts, FeedError>
    where
        I: IntoIterator<Item = Result<ListingRow, NormalizeError>>,
    {
        let mut counts = ReconcileCounts::default();
        let mut seen = HashSet::new();

        for (pos, row) in rows.into_iter().enumerate() {
            if pos % self.stats_every == 0 {
                info!(
                    rows = pos,
                    added = counts.added,
                    updated = counts.updated,
                    removed = counts.removed,
                    "feeding rows"
                );
            }

            let row = row.map_err(|source| FeedError::from_snapshot(snapshot_date, source))?;
            if row.archived {
                continue;
            }
            seen.insert(row.id);

            let Some(existing) = tx.fetch(row.id).await? else {
                audit.record(&format!("Row {}: adding new record", row.id))?;
                tx.insert(&row, snapshot_date).await?;
                counts.added += 1;
                continue;
            };

            if existing.updated_at.map_or(true, |updated_at| updated_at > snapshot_date) {
                let line = format!(
                    "Row {}: newer record detected (updated_at {}, snapshot {snapshot_date})",
                    row.id,
                    existing
                        .updated_at
                        .map_or_else(|| "unset".to_string(), |d| d.to_string()),
                );
                error!(id = row.id, %snapshot_date, "newer record detected");
                audit.record(&line)?;
                return Err(FeedError::Conflict {
                    id: row.id,
                    snapshot_date,
                    updated_at: existing.updated_at,
                });
            }

            let mut patch = ListingPatch {
                columns: diff_fields(&row, &existing),
                ..ListingPatch::default()
            };
            for (spec, value) in &patch.columns {
                audit.record(&format!(
                    "Row {}: updating column {} from {} to {}",
                    row.id,
                    spec.name,
                    cut_text(&render_or_null(existing.field(spec.name)), AUDIT_VALUE_LIMIT),
                    cut_text(&render_or_null(value.as_ref()), AUDIT_VALUE_LIMIT),
                ))?;
            }

            let first_seen = existing.added_at.or(existing.updated_at);
            let added_at = first_seen.map_or(snapshot_date, |d| d.min(snapshot_date));
            if existing.added_at != Some(added_at) {
                audit.record(&format!(
                    "Row {}: updating column {ADDED_AT_COLUMN} from {} to {added_at}",
                    row.id,
                    existing
                        .added_at
                        .map_or_else(|| "NULL".to_string(), |d| d.to_string()),
                ))?;
                patch.added_at = Some(added_at);
            }

            if !patch.columns.is_empty() {
                patch.updated_at = Some(snapshot_date);
                counts.updated += 1;
            }
            if !patch.is_empty() {
                tx.apply(row.id, &patch).await?;
            }
        }

        let mut to_remove = Vec::new();
        for (id, removed_at) in tx.removal_candidates(snapshot_date).await? {
            if seen.contains(&id) {
                continue;
            }
            if removed_at.map_or(true, |removed_at| snapshot_date < removed_at) {
                to_remove.push(id);
            }
        }
        for id in &to_remove {
            audit.record(&format!("Row {id}: marking as removed at {snapshot_date}"))?;
        }
        tx.mark_removed(&to_remove, snapshot_date).await?;
        counts.removed = to_remove.len();

        info!(
            %snapshot_date,
            added = counts.added,
            updated = counts.updated,
            removed = counts.removed,
            "items reconciled"
        );
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{ListingStore, MemoryListingStore};
    use vacancy_snapshot::normalize_record;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(id: i64, fields: &[(&'static str, FieldValue)]) -> ListingRecord {
        ListingRecord {
            id,
            fields: fields.iter().cloned().collect::<BTreeMap<_, _>>(),
            added_at: Some(date(2024, 1, 1)),
            updated_at: Some(date(2024, 1, 1)),
            removed_at: None,
        }
    }

    #[test]
    fn diff_compares_rendered_values() {
        let row = normalize_record(
            &[
                ("id", "1"),
                ("name", "Dev"),
                ("salary_from", "2000"),
                ("salary_to", ""),
                ("premium", "false"),
                ("archived", "false"),
            ],
            2,
        )
        .unwrap();
        let existing = record(
            1,
            &[
                ("name", FieldValue::Text("Dev".into())),
                ("salary_from", FieldValue::Int(1000)),
                ("salary_to", FieldValue::Int(3000)),
                ("archived", FieldValue::Bool(false)),
            ],
        );

        let diff = diff_fields(&row, &existing);
        let changed: Vec<_> = diff.iter().map(|(spec, _)| spec.name).collect();
        assert_eq!(changed, vec!["salary_from", "salary_to", "premium"]);
        assert_eq!(diff[0].1, Some(FieldValue::Int(2000)));
        assert_eq!(diff[1].1, None);
    }

    #[test]
    fn columns_absent_from_snapshot_are_not_compared() {
        let row = normalize_record(&[("id", "1"), ("archived", "false")], 2).unwrap();
        let existing = record(
            1,
            &[
                ("name", FieldValue::Text("Dev".into())),
                ("archived", FieldValue::Bool(false)),
            ],
        );
        assert!(diff_fields(&row, &existing).is_empty());
    }

    #[tokio::test]
    async fn insert_keeps_only_populated_columns() {
        let store = MemoryListingStore::default();
        let rows = vec![normalize_record(
            &[("id", "5"), ("name", ""), ("salary_from", "100"), ("archived", "false")],
            2,
        )];
        let mut tx = store.begin().await.unwrap();
        let mut audit = Vec::new();
        let counts = ReconciliationEngine::new(1)
            .reconcile(tx.as_mut(), rows, date(2024, 1, 1), &mut audit)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(counts, ReconcileCounts { added: 1, updated: 0, removed: 0 });
        let stored = store.get(5).await.unwrap();
        assert!(stored.field("name").is_none());
        assert_eq!(stored.field("salary_from"), Some(&FieldValue::Int(100)));
        assert_eq!(stored.field("archived"), Some(&FieldValue::Bool(false)));
        assert_eq!(audit, vec!["Row 5: adding new record".to_string()]);
    }

    #[tokio::test]
    async fn unset_updated_at_is_a_conflict() {
        let store = MemoryListingStore::default();
        let mut seeded = record(1, &[]);
        seeded.updated_at = None;
        store.seed(seeded).await;

        let rows = vec![normalize_record(&[("id", "1"), ("archived", "false")], 2)];
        let mut tx = store.begin().await.unwrap();
        let mut audit = Vec::new();
        let err = ReconciliationEngine::default()
            .reconcile(tx.as_mut(), rows, date(2024, 1, 2), &mut audit)
            .await
            .unwrap_err();

        assert!(matches!(err, FeedError::Conflict { id: 1, updated_at: None, .. }));
        assert_eq!(
            audit,
            vec!["Row 1: newer record detected (updated_at unset, snapshot 2024-01-02)".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_added_at_is_backfilled_without_counting_an_update() {
        let store = MemoryListingStore::default();
        let mut seeded = record(1, &[("archived", FieldValue::Bool(false))]);
        seeded.added_at = None;
        store.seed(seeded).await;

        let rows = vec![normalize_record(&[("id", "1"), ("archived", "false")], 2)];
        let mut tx = store.begin().await.unwrap();
        let mut audit = Vec::new();
        let counts = ReconciliationEngine::default()
            .reconcile(tx.as_mut(), rows, date(2024, 1, 2), &mut audit)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(counts.updated, 0);
        let stored = store.get(1).await.unwrap();
        assert_eq!(stored.added_at, Some(date(2024, 1, 1)));
        assert_eq!(stored.updated_at, Some(date(2024, 1, 1)));
        assert_eq!(
            audit,
            vec!["Row 1: updating column added_at from NULL to 2024-01-01".to_string()]
        );
    }

    #[tokio::test]
    async fn long_values_are_cut_in_the_audit_log() {
        let store = MemoryListingStore::default();
        store
            .seed(record(1, &[("description", FieldValue::Text("a".repeat(200)))]))
            .await;

        let long = "b".repeat(300);
        let rows = vec![normalize_record(
            &[("id", "1"), ("description", long.as_str()), ("archived", "false")],
            2,
        )];
        let mut tx = store.begin().await.unwrap();
        let mut audit = Vec::new();
        ReconciliationEngine::default()
            .reconcile(tx.as_mut(), rows, date(2024, 1, 2), &mut audit)
            .await
            .unwrap();

        let expected = format!(
            "Row 1: updating column description from {}... to {}...",
            "a".repeat(128),
            "b".repeat(128)
        );
        assert_eq!(audit[0], expected);
        // archived was not seeded, so it shows up as a change too
        assert_eq!(audit[1], "Row 1: updating column archived from NULL to false");
    }
}
