use serde::{Deserialize, Serialize};

/// Outcome of the last successful sync of one issue into the sink, per the
/// `ProcessingLogEntry` schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Created,
    Updated,
    ColdStartExisting,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub issue_key: String,
    /// Epoch millis of `fields.updated` at last sync. `0` is the sentinel
    /// that forces the next cycle to treat this entry as stale.
    pub last_source_updated: i64,
    /// Absent only for `Failed` rows that never reached the sink.
    pub sink_row_id: Option<String>,
    pub outcome: Outcome,
    pub processed_at: i64,
}

impl ProcessingLogEntry {
    pub fn is_stale_sentinel(&self) -> bool {
        self.last_source_updated == 0
    }
}

/// The three-state lifecycle of a cached source-user -> sink-user mapping.
/// Modeled as an enum rather than a pair of `is_empty`/`is_pending` bools so
/// "valid but missing an id" is unrepresentable instead of merely
/// disallowed by convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UserCacheState {
    Valid {
        sink_email: String,
        sink_user_id: String,
        sink_display_name: String,
    },
    Empty,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCacheEntry {
    pub username: String,
    pub state: UserCacheState,
    pub updated_at: i64,
}

impl UserCacheEntry {
    pub fn pending(username: impl Into<String>, now: i64) -> Self {
        Self {
            username: username.into(),
            state: UserCacheState::Pending,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, UserCacheState::Pending)
    }
}
