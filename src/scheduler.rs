//! The daemon's coordinator: one scheduling loop per table binding, each
//! sleeping for its own configured interval between cycles, plus a top
//! level loop that waits for shutdown (Ctrl-C) or, on Unix, a SIGHUP to
//! reload configuration into a fresh [`Runtime`] snapshot without
//! interrupting cycles already in flight.

use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use sync_core::config::BindingId;
use sync_core::{ErrorSeverity, RuntimeHandle};
use tokio_util::sync::CancellationToken;

pub struct Coordinator {
    runtime: Arc<RuntimeHandle>,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(runtime: Arc<RuntimeHandle>) -> Self {
        Self {
            runtime,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn run(&self) -> Result<(), sync_core::SyncError> {
        let binding_ids: Vec<BindingId> = self
            .runtime
            .snapshot()
            .bindings
            .iter()
            .map(|b| b.id())
            .collect();

        let mut handles = Vec::with_capacity(binding_ids.len());
        for binding_id in binding_ids {
            let runtime = self.runtime.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                run_binding_loop(runtime, binding_id, shutdown).await;
            }));
        }

        self.wait_for_signal().await;
        self.shutdown.cancel();

        for handle in handles {
            let _ = handle.await;
        }

        Ok(())
    }

    #[cfg(unix)]
    async fn wait_for_signal(&self) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("failed to install SIGHUP handler, config reload disabled: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    return;
                }
                _ = hangup.recv() => {
                    info!("SIGHUP received, reloading configuration");
                    if let Err(err) = self.runtime.reload().await {
                        error!("configuration reload failed, keeping previous snapshot: {err}");
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_signal(&self) {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    }
}

async fn run_binding_loop(runtime: Arc<RuntimeHandle>, binding_id: BindingId, shutdown: CancellationToken) {
    loop {
        let snapshot = runtime.snapshot();
        let Some(binding) = snapshot.binding(&binding_id).cloned() else {
            info!("{binding_id}: binding removed from configuration, stopping its loop");
            return;
        };
        let Some(workflow) = snapshot.workflow_for(&binding_id) else {
            error!("{binding_id}: no ProcessingLog open for this binding, stopping its loop");
            return;
        };

        let now = Utc::now().timestamp_millis();
        match workflow.run_cycle(&binding, now).await {
            Ok(report) => info!(
                "{binding_id}: cycle complete (created={}, updated={}, failed={}, unchanged={})",
                report.created, report.updated, report.failed, report.skipped_unchanged
            ),
            Err(err) if err.severity() == ErrorSeverity::Fatal => {
                error!("{binding_id}: fatal error, stopping its loop: {err}");
                return;
            }
            Err(err) => warn!("{binding_id}: cycle failed, will retry next interval: {err}"),
        }

        drop(snapshot);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(binding.sync_interval_secs)) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}
