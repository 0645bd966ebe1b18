use chrono::NaiveDate;
use thiserror::Error;
use vacancy_snapshot::NormalizeError;

/// How a failed run should be read by an operator. Every kind rolls back the
/// snapshot date being fed and is retried by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Database or filesystem trouble; expected to clear on its own.
    Transient,
    /// A snapshot older than recorded state; persists until fixed by hand.
    Consistency,
    /// Unparseable snapshot content; persists until fixed by hand.
    Malformed,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(
        "listing {id}: newer record detected (updated_at {}) while feeding snapshot {snapshot_date}",
        display_date(.updated_at)
    )]
    Conflict {
        id: i64,
        snapshot_date: NaiveDate,
        updated_at: Option<NaiveDate>,
    },
    #[error("snapshot {snapshot_date} is malformed: {source}")]
    Malformed {
        snapshot_date: NaiveDate,
        #[source]
        source: NormalizeError,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("writing audit log: {0}")]
    Audit(#[from] std::io::Error),
    #[error(transparent)]
    Snapshot(#[from] anyhow::Error),
}

impl FeedError {
    /// Classifies a snapshot read failure. I/O trouble underneath the CSV
    /// reader is transient; everything else is bad content.
    pub fn from_snapshot(snapshot_date: NaiveDate, source: NormalizeError) -> Self {
        match source {
            NormalizeError::Csv(err) if err.is_io_error() => FeedError::Snapshot(
                anyhow::Error::new(err).context(format!("reading snapshot {snapshot_date}")),
            ),
            source => FeedError::Malformed {
                snapshot_date,
                source,
            },
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            FeedError::Conflict { .. } => FailureKind::Consistency,
            FeedError::Malformed { .. } => FailureKind::Malformed,
            FeedError::Database(_) | FeedError::Audit(_) | FeedError::Snapshot(_) => {
                FailureKind::Transient
            }
        }
    }
}

fn display_date(date: &Option<NaiveDate>) -> String {
    date.map_or_else(|| "unset".to_string(), |d| d.to_string())
}
