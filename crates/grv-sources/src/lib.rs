//! Complaint source contracts plus the store-backed and snapshot-backed readers.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use grv_core::{RawRecord, RawSnapshotRecord, Source};
use grv_storage::{ComplaintStore, StorageError};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "grv-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{origin} source unavailable: {reason}")]
    Unavailable { origin: Source, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A backing store that yields raw complaint records of one native shape.
#[async_trait]
pub trait ComplaintSource: Send + Sync {
    fn source(&self) -> Source;

    async fn fetch(&self) -> Result<Vec<RawRecord>, SourceError>;
}

/// Relational reader over the complaint store.
#[derive(Debug, Clone)]
pub struct StoreSource {
    store: ComplaintStore,
}

impl StoreSource {
    pub fn new(store: ComplaintStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ComplaintSource for StoreSource {
    fn source(&self) -> Source {
        Source::Store
    }

    async fn fetch(&self) -> Result<Vec<RawRecord>, SourceError> {
        let rows = self.store.fetch_complaints().await?;
        Ok(rows.into_iter().map(RawRecord::Store).collect())
    }
}

/// Ordered candidate paths for the ingester's snapshot file; the first existing one is read.
#[derive(Debug, Clone, Default)]
pub struct SnapshotLocation {
    candidates: Vec<PathBuf>,
}

impl SnapshotLocation {
    pub fn new<I, P>(candidates: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
        }
    }

    pub fn single(path: impl Into<PathBuf>) -> Self {
        Self::new([path.into()])
    }

    /// Splits a platform path list such as `a.json:b.json`.
    pub fn from_path_list(list: impl AsRef<OsStr>) -> Self {
        Self::new(std::env::split_paths(list.as_ref()))
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    pub async fn resolve(&self) -> Option<PathBuf> {
        for candidate in &self.candidates {
            if fs::try_exists(candidate).await.unwrap_or(false) {
                return Some(candidate.clone());
            }
        }
        None
    }
}

/// Reader over the JSON array written by the external ingestion process.
#[derive(Debug, Clone)]
pub struct SnapshotSource {
    location: SnapshotLocation,
}

impl SnapshotSource {
    pub fn new(location: SnapshotLocation) -> Self {
        Self { location }
    }

    pub fn location(&self) -> &SnapshotLocation {
        &self.location
    }
}

#[async_trait]
impl ComplaintSource for SnapshotSource {
    fn source(&self) -> Source {
        Source::Snapshot
    }

    async fn fetch(&self) -> Result<Vec<RawRecord>, SourceError> {
        let Some(path) = self.location.resolve().await else {
            return Err(SourceError::Unavailable {
                origin: Source::Snapshot,
                reason: format!("no snapshot file among {:?}", self.location.candidates()),
            });
        };
        let text = fs::read_to_string(&path)
            .await
            .map_err(|err| SourceError::Unavailable {
                origin: Source::Snapshot,
                reason: format!("reading {}: {err}", path.display()),
            })?;
        Ok(parse_snapshot(&text, &path)
            .into_iter()
            .map(RawRecord::Snapshot)
            .collect())
    }
}

/// Unparseable or non-list payloads count as an empty snapshot.
pub fn parse_snapshot(text: &str, path: &Path) -> Vec<RawSnapshotRecord> {
    let value: JsonValue = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "snapshot is not valid JSON; treating as empty");
            return Vec::new();
        }
    };
    let JsonValue::Array(entries) = value else {
        warn!(path = %path.display(), "snapshot payload is not a list; treating as empty");
        return Vec::new();
    };

    let total = entries.len();
    let records = entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match entry {
            JsonValue::Object(_) => serde_json::from_value(entry)
                .map_err(|err| debug!(index, error = %err, "skipping undecodable snapshot entry"))
                .ok(),
            _ => {
                debug!(index, "skipping non-object snapshot entry");
                None
            }
        })
        .collect::<Vec<RawSnapshotRecord>>();
    debug!(path = %path.display(), total, kept = records.len(), "parsed snapshot");
    records
}
