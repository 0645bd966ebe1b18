//! Dated snapshot directories: discovery, atomic publication and the per-run
//! audit log written next to each extract.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{Local, NaiveDate};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;
use uuid::Uuid;
use vacancy_core::AuditSink;

pub const CRATE_NAME: &str = "vacancy-storage";

pub const SNAPSHOT_CSV_NAME: &str = "result.csv";
pub const AUDIT_LOG_NAME: &str = "feeder_log.txt";

const DIR_DATE_FORMAT: &str = "%Y-%m-%d";
const HASH_CHUNK_BYTES: usize = 64 * 1024;

/// One published snapshot directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDir {
    pub date: NaiveDate,
    pub path: PathBuf,
}

impl SnapshotDir {
    pub fn name(&self) -> String {
        self.date.format(DIR_DATE_FORMAT).to_string()
    }

    pub fn csv_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_CSV_NAME)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.path.join(AUDIT_LOG_NAME)
    }

    /// SHA-256 of the extract, streamed in chunks.
    pub async fn content_hash(&self) -> anyhow::Result<String> {
        let path = self.csv_path();
        let mut file = fs::File::open(&path)
            .await
            .with_context(|| format!("opening snapshot {}", path.display()))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_CHUNK_BYTES];
        loop {
            let read = file
                .read(&mut buf)
                .await
                .with_context(|| format!("reading snapshot {}", path.display()))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// True for names shaped exactly like `YYYY-MM-DD`.
pub fn is_snapshot_dir_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("snapshot {0} is already published")]
    AlreadyPublished(NaiveDate),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Root directory holding one sub-directory per snapshot date.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All published snapshot directories, oldest first.
    pub async fn discover(&self) -> anyhow::Result<Vec<SnapshotDir>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("listing snapshot root {}", self.root.display()))?;

        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing snapshot root {}", self.root.display()))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !is_snapshot_dir_name(name) {
                continue;
            }
            let Ok(date) = NaiveDate::parse_from_str(name, DIR_DATE_FORMAT) else {
                warn!(dir = name, "skipping snapshot directory with invalid date");
                continue;
            };
            let is_dir = entry
                .file_type()
                .await
                .with_context(|| format!("inspecting {}", entry.path().display()))?
                .is_dir();
            if !is_dir {
                continue;
            }
            found.push(SnapshotDir {
                date,
                path: entry.path(),
            });
        }

        found.sort_by_key(|dir| dir.date);
        Ok(found)
    }

    /// Published snapshots strictly newer than `watermark`, oldest first.
    pub async fn pending_after(&self, watermark: NaiveDate) -> anyhow::Result<Vec<SnapshotDir>> {
        let mut dirs = self.discover().await?;
        dirs.retain(|dir| dir.date > watermark);
        Ok(dirs)
    }

    /// Publishes an extract for `date`: the CSV is written into a staging
    /// directory that is renamed into place once complete, so readers never
    /// observe a partial snapshot.
    pub async fn publish_snapshot(
        &self,
        date: NaiveDate,
        csv: &[u8],
    ) -> Result<SnapshotDir, PublishError> {
        let dir_name = date.format(DIR_DATE_FORMAT).to_string();
        let final_path = self.root.join(&dir_name);

        if fs::try_exists(&final_path)
            .await
            .with_context(|| format!("checking snapshot path {}", final_path.display()))?
        {
            return Err(PublishError::AlreadyPublished(date));
        }

        let staging = self
            .root
            .join(format!("{dir_name}-unfinished-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&staging)
            .await
            .with_context(|| format!("creating staging directory {}", staging.display()))?;

        match write_and_rename(&staging, &final_path, csv).await {
            Ok(()) => Ok(SnapshotDir {
                date,
                path: final_path,
            }),
            Err(err) => {
                let _ = fs::remove_dir_all(&staging).await;
                Err(err.into())
            }
        }
    }
}

async fn write_and_rename(staging: &Path, final_path: &Path, csv: &[u8]) -> anyhow::Result<()> {
    let csv_path = staging.join(SNAPSHOT_CSV_NAME);
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&csv_path)
        .await
        .with_context(|| format!("opening staged snapshot {}", csv_path.display()))?;
    file.write_all(csv)
        .await
        .with_context(|| format!("writing staged snapshot {}", csv_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing staged snapshot {}", csv_path.display()))?;
    drop(file);

    fs::rename(staging, final_path).await.with_context(|| {
        format!(
            "atomically renaming snapshot {} -> {}",
            staging.display(),
            final_path.display()
        )
    })
}

/// Plain-text change log for one feeding attempt of one snapshot. Lines are
/// buffered by [`AuditSink::record`] and written out on [`AuditLog::flush`].
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    file: fs::File,
    pending: String,
}

impl AuditLog {
    /// Creates (or truncates) the log at `path`.
    pub async fn create(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let file = fs::File::create(&path)
            .await
            .with_context(|| format!("creating audit log {}", path.display()))?;
        Ok(Self {
            path,
            file,
            pending: String::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.file.write_all(self.pending.as_bytes()).await?;
        self.pending.clear();
        self.file.flush().await
    }
}

impl AuditSink for AuditLog {
    fn record(&mut self, line: &str) -> std::io::Result<()> {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        self.pending.push_str(&format!("{stamp} {line}\n"));
        Ok(())
    }
}
