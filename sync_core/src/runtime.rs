//! The dependency-injection container every subcommand builds from config:
//! the source/sink clients, per-table ProcessingLogs, the shared user
//! cache, metrics, and the resolved schema. `RuntimeHandle` wraps it in an
//! `ArcSwap` so the daemon loop can reload configuration without pausing
//! in-flight cycles — a cycle that grabbed a snapshot keeps running against
//! it even if a reload swaps in a new one underneath.

use arc_swap::ArcSwap;
use hashbrown::HashMap;
use jira_client::SourceClient;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sync_store::{MetricsStore, ProcessingLog, UserCache};

use crate::config::{BindingId, Config, TableBinding};
use crate::error::SyncError;
use crate::lark::{LarkClient, SinkClient};
use crate::schema::Schema;
use crate::workflow::WorkflowManager;

pub struct Runtime {
    pub config: Config,
    pub config_path: PathBuf,
    pub source: SourceClient,
    pub sink: LarkClient,
    pub user_cache: UserCache,
    pub metrics: MetricsStore,
    pub schema: Schema,
    pub bindings: Vec<TableBinding>,
    processing_logs: HashMap<BindingId, ProcessingLog>,
}

impl Runtime {
    pub async fn build(config_path: &Path) -> Result<Self, SyncError> {
        let config = Config::load(config_path)?;
        let data_dir = PathBuf::from(&config.global.data_directory);

        std::fs::create_dir_all(&data_dir).map_err(|source| SyncError::DataDirError {
            path: data_dir.display().to_string(),
            source,
        })?;

        let mut bindings = config.bindings()?;
        let file_entries = config.load_schema_file(config_path)?;
        let schema = Schema::build(&config.field_mappings.jira_to_lark, file_entries);

        let source = SourceClient::new(
            config.source.server_url.clone(),
            config.source.username.clone(),
            config.source.password.clone(),
        );
        let sink = LarkClient::new(config.sink.app_id.clone(), config.sink.app_secret.clone());
        let user_cache = UserCache::open(&data_dir)?;
        let metrics = MetricsStore::open(&data_dir)?;

        for binding in &mut bindings {
            let columns = sink
                .list_columns(&binding.workspace_token, &binding.sink_table_id)
                .await?;
            let resolved = binding
                .identity_field_candidates
                .iter()
                .find(|candidate| {
                    columns
                        .iter()
                        .any(|column| column.name.as_str() == candidate.as_str() && column.is_hyperlink())
                })
                .cloned();
            binding.identity_column =
                resolved.ok_or_else(|| SyncError::IdentityColumnNotHyperlink {
                    binding: binding.id().to_string(),
                    candidates: binding.identity_field_candidates.join(", "),
                })?;
        }

        let mut processing_logs = HashMap::new();
        for binding in &bindings {
            let log = ProcessingLog::open(&data_dir, &binding.sink_table_id)?;
            processing_logs.insert(binding.id(), log);
        }

        Ok(Self {
            config,
            config_path: config_path.to_path_buf(),
            source,
            sink,
            user_cache,
            metrics,
            schema,
            bindings,
            processing_logs,
        })
    }

    pub fn binding(&self, id: &BindingId) -> Option<&TableBinding> {
        self.bindings.iter().find(|binding| &binding.id() == id)
    }

    pub fn require_binding(&self, id: &BindingId) -> Result<&TableBinding, SyncError> {
        self.binding(id)
            .ok_or_else(|| SyncError::UnknownBinding(id.to_string()))
    }

    pub fn workflow_for<'a>(&'a self, id: &BindingId) -> Option<WorkflowManager<'a, LarkClient>> {
        let log = self.processing_logs.get(id)?;
        Some(WorkflowManager::new(
            &self.source,
            &self.sink,
            log,
            &self.user_cache,
            &self.metrics,
            &self.schema,
            &self.config.issue_link_rules,
            &self.config.source.server_url,
        ))
    }
}

/// Hot-reloadable handle to the current [`Runtime`] snapshot.
pub struct RuntimeHandle {
    config_path: PathBuf,
    current: ArcSwap<Runtime>,
}

impl RuntimeHandle {
    pub async fn load(config_path: PathBuf) -> Result<Self, SyncError> {
        let runtime = Runtime::build(&config_path).await?;
        Ok(Self {
            config_path,
            current: ArcSwap::new(Arc::new(runtime)),
        })
    }

    /// A stable snapshot to run one cycle against. Reloading afterward
    /// doesn't affect a snapshot already in hand.
    pub fn snapshot(&self) -> Arc<Runtime> {
        self.current.load_full()
    }

    /// Rebuilds the Runtime from disk and swaps it in. Independent
    /// in-flight cycles keep running against the snapshot they already
    /// hold.
    pub async fn reload(&self) -> Result<(), SyncError> {
        let runtime = Runtime::build(&self.config_path).await?;
        self.current.store(Arc::new(runtime));
        Ok(())
    }
}
