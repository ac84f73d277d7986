//! Drives one binding's sync cycle end to end: cold-start seeding, staleness
//! filtering, field projection, user resolution, batched writes, and
//! recording the outcome back into the ProcessingLog and metrics store.

use hashbrown::{HashMap, HashSet};
use jira_client::{Issue, SourceClient};
use log::warn;
use serde_json::{Map, Value};
use sync_store::{BindingMetrics, MetricsStore, Outcome, ProcessingLog, ProcessingLogEntry, UserCache};

use crate::batch::BatchProcessor;
use crate::config::{IssueLinkRule, TableBinding};
use crate::error::SyncError;
use crate::lark::SinkClient;
use crate::schema::{FieldProcessor, Schema};
use crate::user_mapper::{apply_resolved_users, UserMapper};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub skipped_unchanged: usize,
}

pub struct WorkflowManager<'a, C: SinkClient> {
    source: &'a SourceClient,
    sink: &'a C,
    processing_log: &'a ProcessingLog,
    user_cache: &'a UserCache,
    metrics: &'a MetricsStore,
    schema: &'a Schema,
    link_rules: &'a HashMap<String, IssueLinkRule>,
    source_base_url: &'a str,
}

impl<'a, C: SinkClient> WorkflowManager<'a, C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: &'a SourceClient,
        sink: &'a C,
        processing_log: &'a ProcessingLog,
        user_cache: &'a UserCache,
        metrics: &'a MetricsStore,
        schema: &'a Schema,
        link_rules: &'a HashMap<String, IssueLinkRule>,
        source_base_url: &'a str,
    ) -> Self {
        Self {
            source,
            sink,
            processing_log,
            user_cache,
            metrics,
            schema,
            link_rules,
            source_base_url,
        }
    }

    /// The normal scheduled cycle: seeds the ProcessingLog from the sink's
    /// existing rows on first run for this table, then syncs only issues
    /// whose `fields.updated` is newer than what was last recorded.
    pub async fn run_cycle(&self, binding: &TableBinding, now: i64) -> Result<CycleReport, SyncError> {
        if !self.processing_log.is_initialized()? {
            self.seed_cold_start(binding, now).await?;
        }

        let issues = self
            .source
            .search_collect(&binding.filter_expression, None)
            .await?;

        let candidates: Vec<(String, i64)> = issues
            .iter()
            .filter_map(|issue| issue.updated().ok().map(|u| (issue.key.clone(), u.timestamp_millis())))
            .collect();
        let stale_keys: HashSet<String> = self
            .processing_log
            .filter_stale(&candidates)?
            .into_iter()
            .collect();

        let total = issues.len();
        let stale_issues: Vec<Issue> = issues
            .into_iter()
            .filter(|issue| stale_keys.contains(&issue.key))
            .collect();
        let skipped_unchanged = total - stale_issues.len();

        let mut report = self.sync_issues(binding, stale_issues, now).await?;
        report.skipped_unchanged = skipped_unchanged;

        self.record_metrics(binding, &report, now)?;
        Ok(report)
    }

    /// Re-syncs every issue matching the filter expression, ignoring the
    /// ProcessingLog's recorded timestamps. Used by the `maintenance`
    /// subcommand to repair drift that staleness-only filtering can't see
    /// (a sink row edited out of band, for example).
    pub async fn full_refresh(&self, binding: &TableBinding, now: i64) -> Result<CycleReport, SyncError> {
        let issues = self
            .source
            .search_collect(&binding.filter_expression, None)
            .await?;
        let report = self.sync_issues(binding, issues, now).await?;
        self.record_metrics(binding, &report, now)?;
        Ok(report)
    }

    /// Syncs one issue by key regardless of staleness, for the `issue`
    /// subcommand's explicit manual-resync use.
    pub async fn sync_one_issue(
        &self,
        binding: &TableBinding,
        issue_key: &str,
        now: i64,
    ) -> Result<CycleReport, SyncError> {
        let issue = self.source.get(issue_key, None).await?;
        let report = self.sync_issues(binding, vec![issue], now).await?;
        self.record_metrics(binding, &report, now)?;
        Ok(report)
    }

    async fn seed_cold_start(&self, binding: &TableBinding, now: i64) -> Result<(), SyncError> {
        let rows = self
            .sink
            .scan_rows(&binding.workspace_token, &binding.sink_table_id, &binding.identity_column)
            .await?;

        self.processing_log.seed_cold_start(
            rows.into_iter().map(|(row_id, issue_key)| (issue_key, row_id)),
            now,
        )?;
        Ok(())
    }

    async fn sync_issues(
        &self,
        binding: &TableBinding,
        issues: Vec<Issue>,
        now: i64,
    ) -> Result<CycleReport, SyncError> {
        if issues.is_empty() {
            return Ok(CycleReport::default());
        }

        let keys: Vec<String> = issues.iter().map(|issue| issue.key.clone()).collect();
        let (known, _unknown) = self.processing_log.classify(&keys)?;

        let processor = FieldProcessor::new(self.schema, self.link_rules, self.source_base_url);
        let projected: Vec<_> = issues.iter().map(|issue| processor.project(issue)).collect();

        let mut usernames: Vec<String> = projected
            .iter()
            .flat_map(|p| p.columns.iter())
            .filter_map(|(_, v)| match v {
                crate::schema::ProjectedValue::UserRef(u) => Some(u.clone()),
                _ => None,
            })
            .collect();
        usernames.sort_unstable();
        usernames.dedup();

        let mapper = UserMapper::new(self.sink, self.user_cache);
        let resolved = mapper.map(&usernames)?;

        let mut creates: Vec<(String, Map<String, Value>)> = Vec::new();
        let mut updates: Vec<(String, String, Map<String, Value>)> = Vec::new();

        for issue in &projected {
            let row = apply_resolved_users(issue.columns.clone(), &resolved);
            match known.get(&issue.issue_key) {
                Some(row_id) => {
                    let filtered: Map<String, Value> = row
                        .into_iter()
                        .filter(|(column, _)| !binding.excluded_fields.contains(column))
                        .collect();
                    updates.push((issue.issue_key.clone(), row_id.clone(), filtered));
                }
                None => creates.push((issue.issue_key.clone(), row)),
            }
        }

        let mut batcher = BatchProcessor::new(self.sink);
        let create_outcome = batcher
            .create_all(&binding.workspace_token, &binding.sink_table_id, creates)
            .await;
        let update_outcome = batcher
            .update_all(&binding.workspace_token, &binding.sink_table_id, updates)
            .await;

        let by_key: HashMap<String, &Issue> =
            issues.iter().map(|issue| (issue.key.clone(), issue)).collect();
        let mut entries = Vec::with_capacity(
            create_outcome.created.len() + update_outcome.updated.len() + create_outcome.failed.len() + update_outcome.failed.len(),
        );

        for (issue_key, row_id) in &create_outcome.created {
            entries.push(ProcessingLogEntry {
                issue_key: issue_key.clone(),
                last_source_updated: source_updated_millis(&by_key, issue_key),
                sink_row_id: Some(row_id.clone()),
                outcome: Outcome::Created,
                processed_at: now,
            });
        }

        for issue_key in &update_outcome.updated {
            entries.push(ProcessingLogEntry {
                issue_key: issue_key.clone(),
                last_source_updated: source_updated_millis(&by_key, issue_key),
                sink_row_id: known.get(issue_key).cloned(),
                outcome: Outcome::Updated,
                processed_at: now,
            });
        }

        for (issue_key, _reason) in create_outcome.failed.iter().chain(update_outcome.failed.iter()) {
            entries.push(ProcessingLogEntry {
                issue_key: issue_key.clone(),
                last_source_updated: 0,
                sink_row_id: known.get(issue_key).cloned(),
                outcome: Outcome::Failed,
                processed_at: now,
            });
        }

        for issue_key in &update_outcome.stale {
            warn!("{}", SyncError::Precondition(issue_key.clone()));
        }

        if update_outcome.stale.is_empty() {
            self.processing_log.record(entries)?;
        } else {
            // A stale sink row means this table's whole ProcessingLog can no
            // longer be trusted to reflect the sink's actual rows; clearing
            // it forces seed_cold_start to rebuild it from scan_rows on the
            // next cycle instead of leaving dead row ids behind.
            self.processing_log.clear()?;
        }

        Ok(CycleReport {
            created: create_outcome.created.len(),
            updated: update_outcome.updated.len(),
            failed: create_outcome.failed.len() + update_outcome.failed.len() + update_outcome.stale.len(),
            skipped_unchanged: 0,
        })
    }

    fn record_metrics(&self, binding: &TableBinding, report: &CycleReport, now: i64) -> Result<(), SyncError> {
        self.metrics.record(
            &binding.id().to_string(),
            &BindingMetrics {
                last_cycle_started_at: Some(now),
                last_cycle_finished_at: Some(now),
                created: report.created as u64,
                updated: report.updated as u64,
                failed: report.failed as u64,
            },
        )?;
        Ok(())
    }
}

fn source_updated_millis(by_key: &HashMap<String, &Issue>, issue_key: &str) -> i64 {
    by_key
        .get(issue_key)
        .and_then(|issue| issue.updated().ok())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}
