//! Optional observability store (`sync_metrics.db`): per-binding counters
//! the status surface reads. Never consulted by the sync path itself, so a
//! missing or corrupt entry never affects correctness.

use crate::codec::{decode_or_none, encode};
use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingMetrics {
    pub last_cycle_started_at: Option<i64>,
    pub last_cycle_finished_at: Option<i64>,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
}

pub struct MetricsStore {
    db: sled::Db,
}

impl MetricsStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let path = data_dir.join("sync_metrics.db");
        let db = sled::open(&path).map_err(|source| StoreError::OpenError {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { db })
    }

    #[cfg(test)]
    fn open_temporary() -> Self {
        let db = sled::Config::new().temporary(true).open().unwrap();
        Self { db }
    }

    pub fn get(&self, binding_id: &str) -> Result<BindingMetrics, StoreError> {
        let Some(bytes) = self.db.get(binding_id).map_err(StoreError::GetError)? else {
            return Ok(BindingMetrics::default());
        };
        Ok(decode_or_none(&bytes).unwrap_or_default())
    }

    pub fn record(&self, binding_id: &str, metrics: &BindingMetrics) -> Result<(), StoreError> {
        let bytes = encode(metrics)?;
        self.db
            .insert(binding_id.as_bytes(), bytes)
            .map_err(StoreError::PutError)?;
        self.db.flush().map_err(StoreError::FlushError)
    }

    pub fn all(&self) -> Result<Vec<(String, BindingMetrics)>, StoreError> {
        let mut out = Vec::new();
        for item in self.db.iter() {
            let (key, value) = item.map_err(StoreError::GetError)?;
            if let Some(metrics) = decode_or_none(&value) {
                out.push((String::from_utf8_lossy(&key).into_owned(), metrics));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binding_reports_zeroed_default() {
        let store = MetricsStore::open_temporary();
        assert_eq!(store.get("mgmt/tp").unwrap(), BindingMetrics::default());
    }

    #[test]
    fn record_then_get_round_trips() {
        let store = MetricsStore::open_temporary();
        let metrics = BindingMetrics {
            last_cycle_started_at: Some(1_000),
            last_cycle_finished_at: Some(2_000),
            created: 3,
            updated: 1,
            failed: 0,
        };
        store.record("mgmt/tp", &metrics).unwrap();
        assert_eq!(store.get("mgmt/tp").unwrap(), metrics);
    }
}
