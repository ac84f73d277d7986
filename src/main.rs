mod cli;
mod scheduler;

use chrono::{DateTime, Utc};
use clap::Parser;
use cli::{Cli, Command};
use log::{error, info};
use miette::IntoDiagnostic;
use num_format::{Locale, ToFormattedString};
use scheduler::Coordinator;
use std::sync::Arc;
use sync_core::config::BindingId;
use sync_core::maintenance;
use sync_core::{Runtime, RuntimeHandle};

#[tokio::main]
async fn main() -> miette::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Sync { team, table, full_update } => {
            run_sync(&cli.config, team.as_deref(), table.as_deref(), *full_update).await
        }
        Command::Daemon => run_daemon(&cli.config).await,
        Command::Status => run_status(&cli.config).await,
        Command::Issue { team, table, key } => run_issue(&cli.config, team, table, key).await,
        Command::ResolveUsers => run_resolve_users(&cli.config).await,
        Command::Maintenance { full_refresh } => run_maintenance(&cli.config, *full_refresh).await,
    };

    result.into_diagnostic()
}

async fn run_sync(
    config_path: &std::path::Path,
    team: Option<&str>,
    table: Option<&str>,
    full_update: bool,
) -> Result<(), sync_core::SyncError> {
    let runtime = Runtime::build(config_path).await?;
    let now = Utc::now().timestamp_millis();

    for binding in &runtime.bindings {
        if let Some(team) = team {
            if binding.team_id != team {
                continue;
            }
        }
        if let Some(table) = table {
            if binding.table_key != table {
                continue;
            }
        }

        let id = binding.id();
        let Some(workflow) = runtime.workflow_for(&id) else {
            continue;
        };

        let outcome = if full_update {
            workflow.full_refresh(binding, now).await
        } else {
            workflow.run_cycle(binding, now).await
        };

        match outcome {
            Ok(report) => info!(
                "{id}: cycle complete (created={}, updated={}, failed={}, unchanged={})",
                report.created, report.updated, report.failed, report.skipped_unchanged
            ),
            Err(err) => error!("{id}: cycle failed: {err}"),
        }
    }

    Ok(())
}

async fn run_daemon(config_path: &std::path::Path) -> Result<(), sync_core::SyncError> {
    let handle = Arc::new(RuntimeHandle::load(config_path.to_path_buf()).await?);
    let coordinator = Coordinator::new(handle);
    coordinator.run().await
}

async fn run_status(config_path: &std::path::Path) -> Result<(), sync_core::SyncError> {
    let runtime = Runtime::build(config_path).await?;
    for binding in &runtime.bindings {
        let id = binding.id();
        let metrics = runtime.metrics.get(&id.to_string())?;
        let last_finished = metrics
            .last_cycle_finished_at
            .and_then(|millis| DateTime::from_timestamp_millis(millis))
            .map(|dt| {
                chrono_humanize::HumanTime::from(dt)
                    .to_text_en(chrono_humanize::Accuracy::Rough, chrono_humanize::Tense::Past)
            })
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{id}: interval={}s created={} updated={} failed={} last cycle finished {last_finished}",
            binding.sync_interval_secs,
            metrics.created.to_formatted_string(&Locale::en),
            metrics.updated.to_formatted_string(&Locale::en),
            metrics.failed.to_formatted_string(&Locale::en),
        );
    }
    Ok(())
}

async fn run_issue(
    config_path: &std::path::Path,
    team: &str,
    table: &str,
    key: &str,
) -> Result<(), sync_core::SyncError> {
    let runtime = Runtime::build(config_path).await?;
    let id = BindingId {
        team_id: team.to_string(),
        table_key: table.to_string(),
    };
    let binding = runtime.require_binding(&id)?;
    let workflow = runtime
        .workflow_for(&id)
        .ok_or_else(|| sync_core::SyncError::UnknownBinding(id.to_string()))?;

    let now = Utc::now().timestamp_millis();
    let report = workflow.sync_one_issue(binding, key, now).await?;
    info!(
        "{id}: synced {key} (created={}, updated={}, failed={})",
        report.created, report.updated, report.failed
    );
    Ok(())
}

async fn run_resolve_users(config_path: &std::path::Path) -> Result<(), sync_core::SyncError> {
    let runtime = Runtime::build(config_path).await?;
    let now = Utc::now().timestamp_millis();
    let resolved = maintenance::resolve_pending_users(&runtime.sink, &runtime.user_cache, now, 8).await?;
    info!("resolved {resolved} previously pending username(s)");
    Ok(())
}

async fn run_maintenance(config_path: &std::path::Path, full_refresh: bool) -> Result<(), sync_core::SyncError> {
    let runtime = Runtime::build(config_path).await?;
    let now = Utc::now().timestamp_millis();

    for binding in &runtime.bindings {
        let id = binding.id();
        match maintenance::scan_duplicates(&runtime.sink, binding).await {
            Ok(duplicates) if duplicates.is_empty() => info!("{id}: no duplicate rows found"),
            Ok(duplicates) => {
                for group in duplicates {
                    error!(
                        "{id}: issue {} has {} sink rows: {:?}",
                        group.issue_key,
                        group.row_ids.len(),
                        group.row_ids
                    );
                }
            }
            Err(err) => error!("{id}: duplicate scan failed: {err}"),
        }

        if full_refresh {
            let Some(workflow) = runtime.workflow_for(&id) else {
                continue;
            };
            match workflow.full_refresh(binding, now).await {
                Ok(report) => info!(
                    "{id}: full refresh complete (created={}, updated={}, failed={})",
                    report.created, report.updated, report.failed
                ),
                Err(err) => error!("{id}: full refresh failed: {err}"),
            }
        }
    }

    Ok(())
}
