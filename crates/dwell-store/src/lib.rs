//! Snapshot repository + atomic unified-dataset writer for Dwell.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use dwell_core::{ListingRecord, RentalRecord, SoldRecord, SourceCategory, UnifiedDataset};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dwell-store";

/// One scrape-source directory feeding a category of the shared dataset.
#[derive(Debug, Clone)]
pub struct SnapshotSource {
    pub source_id: String,
    pub category: SourceCategory,
    pub dir: PathBuf,
}

/// Per-category load result: parsed records plus file-level accounting.
/// `files_skipped` counts snapshots that were unreadable or malformed.
#[derive(Debug, Clone)]
pub struct SnapshotBatch<T> {
    pub records: Vec<T>,
    pub files_read: usize,
    pub files_skipped: usize,
}

impl<T> Default for SnapshotBatch<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            files_read: 0,
            files_skipped: 0,
        }
    }
}

impl<T> SnapshotBatch<T> {
    /// A batch standing in for one successfully-read snapshot file.
    pub fn of(records: Vec<T>) -> Self {
        Self {
            records,
            files_read: 1,
            files_skipped: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WrittenDataset {
    pub path: PathBuf,
    pub byte_size: usize,
    pub sha256: String,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("serializing unified dataset: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("writing dataset to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Seam between the consolidation pipeline and the snapshot/dataset storage.
/// The filesystem implementation is [`FsSnapshotStore`]; tests run against
/// [`MemorySnapshotStore`].
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn load_sold(&self) -> Result<SnapshotBatch<SoldRecord>>;
    async fn load_listings(&self) -> Result<SnapshotBatch<ListingRecord>>;
    async fn load_rentals(&self) -> Result<SnapshotBatch<RentalRecord>>;
    async fn write_unified(&self, dataset: &UnifiedDataset) -> Result<WrittenDataset, WriteError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// First `YYYY-MM-DD` date embedded in the file name, if any. Snapshot files
/// are conventionally named `<source>-<date>.json`; the embedded date beats
/// filesystem mtime because it survives copies and rsyncs.
pub fn filename_date(path: &Path) -> Option<NaiveDate> {
    let stem = path.file_stem()?.to_str()?;
    let bytes = stem.as_bytes();
    for i in 0..bytes.len().saturating_sub(9) {
        if bytes[i + 4] != b'-' || bytes[i + 7] != b'-' {
            continue;
        }
        let Some(candidate) = stem.get(i..i + 10) else {
            continue;
        };
        if let Ok(date) = NaiveDate::parse_from_str(candidate, "%Y-%m-%d") {
            return Some(date);
        }
    }
    None
}

#[derive(Debug, Clone)]
struct SnapshotFile {
    path: PathBuf,
    date: Option<NaiveDate>,
    modified: SystemTime,
}

/// Filesystem-backed repository: reads dated snapshot files from per-source
/// directories and writes the unified dataset atomically.
#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    sources: Vec<SnapshotSource>,
    output_path: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(sources: Vec<SnapshotSource>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            sources,
            output_path: output_path.into(),
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn sources(&self) -> &[SnapshotSource] {
        &self.sources
    }

    fn sources_for(&self, category: SourceCategory) -> impl Iterator<Item = &SnapshotSource> {
        self.sources.iter().filter(move |s| s.category == category)
    }

    /// All `*.json` files in a source directory, oldest first. Recency is
    /// filename date, then mtime, then path, so ordering is deterministic
    /// even for undateable names. A missing directory is just zero files.
    async fn snapshot_files(dir: &Path) -> Result<Vec<SnapshotFile>> {
        let mut read_dir = match fs::read_dir(dir).await {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading snapshot dir {}", dir.display()))
            }
        };

        let mut files = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .with_context(|| format!("reading snapshot dir {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .with_context(|| format!("stat {}", path.display()))?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push(SnapshotFile {
                date: filename_date(&path),
                path,
                modified,
            });
        }

        files.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then(a.modified.cmp(&b.modified))
                .then(a.path.cmp(&b.path))
        });
        Ok(files)
    }

    /// Parse one snapshot file. A file that cannot be read or does not hold
    /// an array of the expected shape is skipped with a warning; one corrupt
    /// snapshot must never block consolidation of the rest.
    async fn read_records<T: DeserializeOwned>(path: &Path) -> Option<Vec<T>> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable snapshot file");
                return None;
            }
        };
        match serde_json::from_str::<Vec<T>>(&text) {
            Ok(records) => Some(records),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping malformed snapshot file");
                None
            }
        }
    }

    /// Sold history: every file from every source, accumulated.
    async fn load_accumulated<T: DeserializeOwned>(
        &self,
        category: SourceCategory,
    ) -> Result<SnapshotBatch<T>> {
        let mut batch = SnapshotBatch::default();
        for source in self.sources_for(category) {
            for file in Self::snapshot_files(&source.dir).await? {
                match Self::read_records::<T>(&file.path).await {
                    Some(records) => {
                        batch.records.extend(records);
                        batch.files_read += 1;
                    }
                    None => batch.files_skipped += 1,
                }
            }
        }
        Ok(batch)
    }

    /// Point-in-time categories: the most recent parseable file per source.
    /// If the newest snapshot is corrupt we fall back to the next one rather
    /// than presenting an empty category.
    async fn load_latest<T: DeserializeOwned>(
        &self,
        category: SourceCategory,
    ) -> Result<SnapshotBatch<T>> {
        let mut batch = SnapshotBatch::default();
        for source in self.sources_for(category) {
            let files = Self::snapshot_files(&source.dir).await?;
            for file in files.iter().rev() {
                match Self::read_records::<T>(&file.path).await {
                    Some(records) => {
                        batch.records.extend(records);
                        batch.files_read += 1;
                        break;
                    }
                    None => batch.files_skipped += 1,
                }
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl SnapshotRepository for FsSnapshotStore {
    async fn load_sold(&self) -> Result<SnapshotBatch<SoldRecord>> {
        self.load_accumulated(SourceCategory::Sold).await
    }

    async fn load_listings(&self) -> Result<SnapshotBatch<ListingRecord>> {
        self.load_latest(SourceCategory::Listings).await
    }

    async fn load_rentals(&self) -> Result<SnapshotBatch<RentalRecord>> {
        self.load_latest(SourceCategory::Rentals).await
    }

    /// Write via temp file + rename so the dashboard never observes a
    /// truncated dataset; a crashed run leaves the previous artifact intact.
    async fn write_unified(&self, dataset: &UnifiedDataset) -> Result<WrittenDataset, WriteError> {
        let mut bytes = serde_json::to_vec_pretty(dataset)?;
        bytes.push(b'\n');
        let sha256 = sha256_hex(&bytes);

        let path = &self.output_path;
        let io_err = |p: &Path| {
            let p = p.to_path_buf();
            move |source: std::io::Error| WriteError::Io { path: p, source }
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(io_err(parent))?;
            }
        }

        let temp_path = path.with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(&bytes).await.map_err(io_err(&temp_path))?;
        file.flush().await.map_err(io_err(&temp_path))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(WriteError::Io {
                path: path.clone(),
                source: err,
            });
        }

        Ok(WrittenDataset {
            path: path.clone(),
            byte_size: bytes.len(),
            sha256,
        })
    }
}

#[async_trait]
impl<T: SnapshotRepository + ?Sized> SnapshotRepository for std::sync::Arc<T> {
    async fn load_sold(&self) -> Result<SnapshotBatch<SoldRecord>> {
        (**self).load_sold().await
    }

    async fn load_listings(&self) -> Result<SnapshotBatch<ListingRecord>> {
        (**self).load_listings().await
    }

    async fn load_rentals(&self) -> Result<SnapshotBatch<RentalRecord>> {
        (**self).load_rentals().await
    }

    async fn write_unified(&self, dataset: &UnifiedDataset) -> Result<WrittenDataset, WriteError> {
        (**self).write_unified(dataset).await
    }
}

/// In-memory repository for pipeline tests: serves canned batches and
/// records every written dataset.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    sold: SnapshotBatch<SoldRecord>,
    listings: SnapshotBatch<ListingRecord>,
    rentals: SnapshotBatch<RentalRecord>,
    written: Mutex<Vec<UnifiedDataset>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sold(mut self, records: Vec<SoldRecord>) -> Self {
        self.sold = SnapshotBatch::of(records);
        self
    }

    pub fn with_sold_batch(mut self, batch: SnapshotBatch<SoldRecord>) -> Self {
        self.sold = batch;
        self
    }

    pub fn with_listings(mut self, records: Vec<ListingRecord>) -> Self {
        self.listings = SnapshotBatch::of(records);
        self
    }

    pub fn with_rentals(mut self, records: Vec<RentalRecord>) -> Self {
        self.rentals = SnapshotBatch::of(records);
        self
    }

    /// Datasets written so far, oldest first.
    pub fn written(&self) -> Vec<UnifiedDataset> {
        self.written.lock().expect("written lock").clone()
    }
}

#[async_trait]
impl SnapshotRepository for MemorySnapshotStore {
    async fn load_sold(&self) -> Result<SnapshotBatch<SoldRecord>> {
        Ok(self.sold.clone())
    }

    async fn load_listings(&self) -> Result<SnapshotBatch<ListingRecord>> {
        Ok(self.listings.clone())
    }

    async fn load_rentals(&self) -> Result<SnapshotBatch<RentalRecord>> {
        Ok(self.rentals.clone())
    }

    async fn write_unified(&self, dataset: &UnifiedDataset) -> Result<WrittenDataset, WriteError> {
        let mut bytes = serde_json::to_vec_pretty(dataset)?;
        bytes.push(b'\n');
        let sha256 = sha256_hex(&bytes);
        let byte_size = bytes.len();
        self.written
            .lock()
            .expect("written lock")
            .push(dataset.clone());
        Ok(WrittenDataset {
            path: PathBuf::from("<memory>"),
            byte_size,
            sha256,
        })
    }
}
