//! Off-cycle upkeep: the duplicate-row scan that runs in the daily
//! maintenance window, and the offline user-resolution pass the
//! `resolve-users` subcommand drives.
//!
//! Neither of these touches the sink destructively — duplicates are
//! reported, not deleted, since telling a real duplicate row apart from two
//! issues that legitimately share an identity-column value isn't something
//! this system can do safely without a human looking at the report first.

use hashbrown::HashMap;
use sync_store::UserCache;

use crate::config::TableBinding;
use crate::error::SyncError;
use crate::lark::SinkClient;
use crate::user_mapper::UserMapper;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub issue_key: String,
    pub row_ids: Vec<String>,
}

/// Scans a table's sink rows for more than one row sharing an identity
/// value, which would otherwise mean both rows receive every future update
/// for that issue.
pub async fn scan_duplicates<C: SinkClient>(
    sink: &C,
    binding: &TableBinding,
) -> Result<Vec<DuplicateGroup>, SyncError> {
    let rows = sink
        .scan_rows(&binding.workspace_token, &binding.sink_table_id, &binding.identity_column)
        .await?;

    let mut by_key: HashMap<String, Vec<String>> = HashMap::new();
    for (row_id, issue_key) in rows {
        by_key.entry(issue_key).or_default().push(row_id);
    }

    Ok(by_key
        .into_iter()
        .filter(|(_, row_ids)| row_ids.len() > 1)
        .map(|(issue_key, row_ids)| DuplicateGroup { issue_key, row_ids })
        .collect())
}

/// Retries resolution for every username still `Pending` in the cache,
/// for the standalone `resolve-users` maintenance pass.
pub async fn resolve_pending_users<C: SinkClient>(
    sink: &C,
    cache: &UserCache,
    now: i64,
    concurrency: usize,
) -> Result<usize, SyncError> {
    let mapper = UserMapper::new(sink, cache);
    let pending = mapper.pending_usernames()?;
    if pending.is_empty() {
        return Ok(0);
    }

    let resolved = mapper.resolve(&pending, now, concurrency).await?;
    Ok(resolved.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lark::{SinkError, SinkUser};
    use async_trait::async_trait;
    use hashbrown::HashSet;
    use serde_json::{Map, Value};

    struct FakeSink {
        rows: Vec<(String, String)>,
    }

    #[async_trait]
    impl SinkClient for FakeSink {
        async fn list_columns(
            &self,
            _workspace_token: &str,
            _table_id: &str,
        ) -> Result<Vec<crate::lark::SinkColumn>, SinkError> {
            Ok(Vec::new())
        }

        async fn scan_rows(
            &self,
            _workspace_token: &str,
            _table_id: &str,
            _identity_column: &str,
        ) -> Result<Vec<(String, String)>, SinkError> {
            Ok(self.rows.clone())
        }

        async fn create_records(
            &self,
            _workspace_token: &str,
            _table_id: &str,
            _records: Vec<Map<String, Value>>,
        ) -> Result<Vec<String>, SinkError> {
            Ok(Vec::new())
        }

        async fn update_record(
            &self,
            _workspace_token: &str,
            _table_id: &str,
            _row_id: &str,
            _fields: Map<String, Value>,
        ) -> Result<(), SinkError> {
            Ok(())
        }

        async fn lookup_user_by_email(&self, _email: &str) -> Result<Option<SinkUser>, SinkError> {
            Ok(None)
        }
    }

    fn binding() -> TableBinding {
        TableBinding {
            team_id: "mgmt".to_string(),
            table_key: "tp".to_string(),
            workspace_token: "ws".to_string(),
            sink_table_id: "tbl".to_string(),
            filter_expression: "project = TP".to_string(),
            sync_interval_secs: 900,
            excluded_fields: HashSet::new(),
            identity_field_candidates: vec!["Ticket".to_string()],
            identity_column: "Ticket".to_string(),
        }
    }

    #[tokio::test]
    async fn finds_groups_with_more_than_one_row() {
        let sink = FakeSink {
            rows: vec![
                ("row_a".to_string(), "TP-1".to_string()),
                ("row_b".to_string(), "TP-1".to_string()),
                ("row_c".to_string(), "TP-2".to_string()),
            ],
        };

        let duplicates = scan_duplicates(&sink, &binding()).await.unwrap();
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].issue_key, "TP-1");
        assert_eq!(duplicates[0].row_ids.len(), 2);
    }

    #[tokio::test]
    async fn no_duplicates_when_every_key_is_unique() {
        let sink = FakeSink {
            rows: vec![
                ("row_a".to_string(), "TP-1".to_string()),
                ("row_b".to_string(), "TP-2".to_string()),
            ],
        };

        assert!(scan_duplicates(&sink, &binding()).await.unwrap().is_empty());
    }
}
