//! Durable processed-id storage.
//!
//! The pipeline treats persistence as an abstract append-only ledger with
//! insert-or-ignore semantics: saving the same unique id twice must be a
//! harmless no-op, because the retry queue and the persist worker can both
//! deliver the same record.
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryStore`]: process-lifetime map, used by tests and simulators.
//! - [`JsonlStore`]: append-only JSON-lines ledger file, the default backend
//!   for the operator binary.

use crate::error::{PulseError, PulseResult};
use crate::event::ProcessedIdRecord;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Abstract durable store for processed unique ids.
#[async_trait]
pub trait ProcessedIdStore: Send + Sync {
    /// Persist a newly credited unique id.
    ///
    /// Must be idempotent: calling twice with the same id is a no-op, not an
    /// error.
    async fn save_processed_id(&self, record: &ProcessedIdRecord) -> PulseResult<()>;

    /// Load every persisted unique id (lowercase hex).
    ///
    /// Returns an empty set, not an error, when no data exists yet.
    async fn load_processed_ids(&self) -> PulseResult<HashSet<String>>;

    /// Delete records older than the retention window.
    async fn cleanup_old_ids(&self, keep_days: i64) -> PulseResult<()>;
}

// =============================================================================
// MemoryStore
// =============================================================================

/// In-memory store with insert-or-ignore semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: parking_lot::Mutex<HashMap<String, ProcessedIdRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl ProcessedIdStore for MemoryStore {
    async fn save_processed_id(&self, record: &ProcessedIdRecord) -> PulseResult<()> {
        self.records
            .lock()
            .entry(record.unique_id_hex.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn load_processed_ids(&self) -> PulseResult<HashSet<String>> {
        Ok(self.records.lock().keys().cloned().collect())
    }

    async fn cleanup_old_ids(&self, keep_days: i64) -> PulseResult<()> {
        let cutoff = Utc::now() - chrono::Duration::days(keep_days);
        self.records.lock().retain(|_, r| r.recorded_at >= cutoff);
        Ok(())
    }
}

// =============================================================================
// JsonlStore
// =============================================================================

/// Append-only JSON-lines ledger file.
///
/// Each record is one JSON object per line. Saves append; cleanup rewrites the
/// file keeping only records inside the retention window. A cached id set
/// backs the insert-or-ignore check so duplicate saves never touch the file.
pub struct JsonlStore {
    path: PathBuf,
    /// Ids already on disk. The async mutex also serializes file access.
    known: tokio::sync::Mutex<HashSet<String>>,
}

impl JsonlStore {
    /// Open (or create on first save) the ledger at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing ledger file cannot be read.
    pub async fn open(path: impl Into<PathBuf>) -> PulseResult<Self> {
        let path = path.into();
        let records = Self::read_records(&path).await?;
        let known = records.into_iter().map(|r| r.unique_id_hex).collect();
        Ok(Self {
            path,
            known: tokio::sync::Mutex::new(known),
        })
    }

    async fn read_records(path: &PathBuf) -> PulseResult<Vec<ProcessedIdRecord>> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ProcessedIdRecord>(line) {
                Ok(record) => records.push(record),
                // A torn write at the tail (crash mid-append) loses one
                // record, never the ledger.
                Err(e) => {
                    tracing::warn!(line = line_no + 1, error = %e, "skipping corrupt ledger line");
                }
            }
        }
        Ok(records)
    }

    async fn rewrite(&self, records: &[ProcessedIdRecord]) -> PulseResult<()> {
        let mut contents = String::new();
        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|e| PulseError::Store(format!("serialize ledger record: {e}")))?;
            contents.push_str(&line);
            contents.push('\n');
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessedIdStore for JsonlStore {
    async fn save_processed_id(&self, record: &ProcessedIdRecord) -> PulseResult<()> {
        let mut known = self.known.lock().await;
        if known.contains(&record.unique_id_hex) {
            return Ok(());
        }

        let line = serde_json::to_string(record)
            .map_err(|e| PulseError::Store(format!("serialize ledger record: {e}")))?;

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        known.insert(record.unique_id_hex.clone());
        Ok(())
    }

    async fn load_processed_ids(&self) -> PulseResult<HashSet<String>> {
        Ok(self.known.lock().await.clone())
    }

    async fn cleanup_old_ids(&self, keep_days: i64) -> PulseResult<()> {
        let mut known = self.known.lock().await;
        let cutoff = Utc::now() - chrono::Duration::days(keep_days);

        let mut records = Self::read_records(&self.path).await?;
        let before = records.len();
        records.retain(|r| r.recorded_at >= cutoff);
        if records.len() == before {
            return Ok(());
        }

        self.rewrite(&records).await?;
        *known = records.into_iter().map(|r| r.unique_id_hex).collect();
        tracing::info!(
            removed = before - known.len(),
            retained = known.len(),
            "ledger cleanup complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn record(id: &str) -> ProcessedIdRecord {
        ProcessedIdRecord {
            unique_id_hex: id.to_string(),
            accepter: "bill_accepter".to_string(),
            pulse_count: 5,
            amount_credited: 5,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_save_is_idempotent() {
        let store = MemoryStore::new();
        store.save_processed_id(&record("aa")).await.unwrap();
        store.save_processed_id(&record("aa")).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_cleanup_by_age() {
        let store = MemoryStore::new();
        let mut old = record("aa");
        old.recorded_at = Utc::now() - ChronoDuration::days(40);
        store.save_processed_id(&old).await.unwrap();
        store.save_processed_id(&record("bb")).await.unwrap();

        store.cleanup_old_ids(30).await.unwrap();

        let ids = store.load_processed_ids().await.unwrap();
        assert!(!ids.contains("aa"));
        assert!(ids.contains("bb"));
    }

    #[tokio::test]
    async fn test_jsonl_store_missing_file_is_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path().join("ledger.jsonl")).await.unwrap();
        assert!(store.load_processed_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jsonl_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let store = JsonlStore::open(&path).await.unwrap();
        store.save_processed_id(&record("aa")).await.unwrap();
        store.save_processed_id(&record("bb")).await.unwrap();
        store.save_processed_id(&record("aa")).await.unwrap();
        drop(store);

        let reopened = JsonlStore::open(&path).await.unwrap();
        let ids = reopened.load_processed_ids().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("aa") && ids.contains("bb"));
    }

    #[tokio::test]
    async fn test_jsonl_store_cleanup_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let store = JsonlStore::open(&path).await.unwrap();
        let mut old = record("aa");
        old.recorded_at = Utc::now() - ChronoDuration::days(40);
        store.save_processed_id(&old).await.unwrap();
        store.save_processed_id(&record("bb")).await.unwrap();

        store.cleanup_old_ids(30).await.unwrap();
        let ids = store.load_processed_ids().await.unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains("bb"));

        // The rewritten file reflects the retained set after reopen.
        let reopened = JsonlStore::open(&path).await.unwrap();
        assert_eq!(reopened.load_processed_ids().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_jsonl_store_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let store = JsonlStore::open(&path).await.unwrap();
        store.save_processed_id(&record("aa")).await.unwrap();
        drop(store);

        // Simulate a torn write at the tail.
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{\"unique_id_hex\": \"trunc").unwrap();
        drop(file);

        let reopened = JsonlStore::open(&path).await.unwrap();
        let ids = reopened.load_processed_ids().await.unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains("aa"));
    }
}
