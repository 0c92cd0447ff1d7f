//! Result recorder: append-only writer against the analytics store.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use ecoscan_model::{ScanRecord, WorkVersion};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Revision of the row schema; part of the work version.
pub const SCHEMA_VERSION: &str = "3";

/// Rows above this serialized size fail the append in the underlying store;
/// reject them up front.
pub const MAX_ROW_BYTES: usize = 10 << 20;

/// Key of the stored-work-version map: `(module_path, version)`.
pub type ModuleKey = (String, String);

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("row too large: {0} bytes")]
    RowTooLarge(usize),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Upserts one row, keyed by `(module_path, version, work_version)`.
    /// At-least-once: re-appends of the same key are tolerated downstream.
    async fn upsert(&self, row: &ScanRecord) -> Result<(), AnalyticsError>;

    /// For each `(module_path, version)`, the work version that produced the
    /// most recent successful row.
    async fn read_work_versions(&self) -> Result<HashMap<ModuleKey, WorkVersion>, AnalyticsError>;
}

/// Serializes a row, enforcing the store's size ceiling.
pub fn encode_row(row: &ScanRecord) -> Result<Vec<u8>, AnalyticsError> {
    let encoded = serde_json::to_vec(row)?;
    if encoded.len() > MAX_ROW_BYTES {
        return Err(AnalyticsError::RowTooLarge(encoded.len()));
    }
    Ok(encoded)
}

/// File-backed store writing one JSON row per line.
pub struct NdjsonResultStore {
    path: PathBuf,
    // Serializes appends so concurrent scans never interleave lines.
    write_lock: Mutex<()>,
}

impl NdjsonResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl ResultStore for NdjsonResultStore {
    async fn upsert(&self, row: &ScanRecord) -> Result<(), AnalyticsError> {
        let mut encoded = encode_row(row)?;
        encoded.push(b'\n');
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&encoded).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_work_versions(&self) -> Result<HashMap<ModuleKey, WorkVersion>, AnalyticsError> {
        let mut versions = HashMap::new();
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(err) => return Err(err.into()),
        };
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let row: ScanRecord = match serde_json::from_str(line) {
                Ok(row) => row,
                Err(err) => {
                    warn!(%err, "skipping malformed result row");
                    continue;
                }
            };
            if row.is_success() {
                // Later lines are newer; last successful row wins.
                versions.insert((row.module_path, row.version), row.work_version);
            }
        }
        Ok(versions)
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryResultStore {
    pub rows: std::sync::Mutex<Vec<ScanRecord>>,
    pub stored_versions: std::sync::Mutex<HashMap<ModuleKey, WorkVersion>>,
}

impl InMemoryResultStore {
    pub fn with_work_version(module: &str, version: &str, wv: WorkVersion) -> Self {
        let store = Self::default();
        store
            .stored_versions
            .lock()
            .unwrap()
            .insert((module.to_string(), version.to_string()), wv);
        store
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn upsert(&self, row: &ScanRecord) -> Result<(), AnalyticsError> {
        encode_row(row)?;
        self.rows.lock().unwrap().push(row.clone());
        Ok(())
    }

    async fn read_work_versions(&self) -> Result<HashMap<ModuleKey, WorkVersion>, AnalyticsError> {
        Ok(self.stored_versions.lock().unwrap().clone())
    }
}
