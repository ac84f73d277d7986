//! Per-table durable index of synced issues, one `sled::Tree` per
//! `table_id` (`processing_log_<table_id>` on disk, per the configured
//! data directory): a plain on-disk index keyed by issue key, one embedded
//! database per table rather than a named tree within a shared one.

use crate::codec::{decode_or_none, encode};
use crate::error::StoreError;
use crate::models::{Outcome, ProcessingLogEntry};
use hashbrown::HashMap;
use std::path::Path;

/// Not a legal issue key (issue keys are `PROJECT-NUMBER`), so it can't
/// collide with a real entry.
const INITIALIZED_MARKER: &[u8] = b"\0initialized";

/// One embedded database per table, on disk at
/// `<data_dir>/processing_log_<table_id>.db`, per the persisted state
/// layout. `sled::Db` derefs to its default tree, so it's used directly
/// rather than opening a named tree within a shared database.
pub struct ProcessingLog {
    tree: sled::Db,
}

impl ProcessingLog {
    pub fn open(data_dir: &Path, table_id: &str) -> Result<Self, StoreError> {
        let path = data_dir.join(format!("processing_log_{table_id}.db"));
        let tree = sled::open(&path).map_err(|source| StoreError::OpenError {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { tree })
    }

    #[cfg(test)]
    fn open_temporary() -> Self {
        let tree = sled::Config::new().temporary(true).open().unwrap();
        Self { tree }
    }

    pub fn is_initialized(&self) -> Result<bool, StoreError> {
        self.tree
            .contains_key(INITIALIZED_MARKER)
            .map_err(StoreError::GetError)
    }

    pub fn mark_initialized(&self) -> Result<(), StoreError> {
        self.tree
            .insert(INITIALIZED_MARKER, b"1".as_slice())
            .map_err(StoreError::PutError)?;
        self.tree.flush().map_err(StoreError::FlushError)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.tree.clear().map_err(StoreError::PutError)?;
        self.tree.flush().map_err(StoreError::FlushError)
    }

    pub fn get(&self, issue_key: &str) -> Result<Option<ProcessingLogEntry>, StoreError> {
        let Some(bytes) = self.tree.get(issue_key).map_err(StoreError::GetError)? else {
            return Ok(None);
        };
        Ok(decode_or_none(&bytes))
    }

    /// Returns the subset of `candidates` with no ProcessingLog entry, or
    /// whose source `updated` strictly exceeds the recorded value.
    pub fn filter_stale(
        &self,
        candidates: &[(String, i64)],
    ) -> Result<Vec<String>, StoreError> {
        let mut stale = Vec::new();
        for (issue_key, updated) in candidates {
            match self.get(issue_key)? {
                None => stale.push(issue_key.clone()),
                Some(entry) if *updated > entry.last_source_updated => {
                    stale.push(issue_key.clone())
                }
                Some(_) => {}
            }
        }
        Ok(stale)
    }

    /// Splits `issue_keys` into those with a known sink row id (carrying
    /// it) and those with none (new to this table, or previously failed
    /// without reaching the sink).
    pub fn classify(
        &self,
        issue_keys: &[String],
    ) -> Result<(HashMap<String, String>, Vec<String>), StoreError> {
        let mut known = HashMap::new();
        let mut unknown = Vec::new();

        for issue_key in issue_keys {
            match self.get(issue_key)? {
                Some(ProcessingLogEntry {
                    sink_row_id: Some(row_id),
                    ..
                }) => {
                    known.insert(issue_key.clone(), row_id);
                }
                _ => unknown.push(issue_key.clone()),
            }
        }

        Ok((known, unknown))
    }

    /// Idempotent upsert by issue key, committed as a single batch so a
    /// cycle's outcomes land atomically.
    pub fn record(&self, entries: Vec<ProcessingLogEntry>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut batch = sled::Batch::default();
        for entry in &entries {
            let bytes = encode(entry)?;
            batch.insert(entry.issue_key.as_bytes(), bytes);
        }
        self.tree.apply_batch(batch).map_err(StoreError::PutError)?;
        self.tree.flush().map_err(StoreError::FlushError)
    }

    /// Convenience for cold start: seeds every existing sink row as a
    /// zero-timestamp entry so the next filter pass treats it as stale.
    pub fn seed_cold_start(
        &self,
        rows: impl IntoIterator<Item = (String, String)>,
        now: i64,
    ) -> Result<(), StoreError> {
        let entries = rows
            .into_iter()
            .map(|(issue_key, sink_row_id)| ProcessingLogEntry {
                issue_key,
                last_source_updated: 0,
                sink_row_id: Some(sink_row_id),
                outcome: Outcome::ColdStartExisting,
                processed_at: now,
            })
            .collect();
        self.record(entries)?;
        self.mark_initialized()
    }
}
