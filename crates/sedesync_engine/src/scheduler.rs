//! Periodic runner.
//!
//! Every interval each registered site gets one incremental run; on a
//! separate interval each site is cleaned up. Runs execute on the blocking
//! pool since storage and transport calls are synchronous.

use crate::config::SchedulerConfig;
use crate::engine::SyncEngine;
use crate::reports::RunOutcome;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Drives an engine on a fixed schedule.
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Creates a scheduler for `engine`.
    pub fn new(engine: Arc<SyncEngine>, config: SchedulerConfig) -> Self {
        Self { engine, config }
    }

    /// Starts the loop on the current tokio runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(self.run(signal));
        SchedulerHandle { shutdown, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut sync_tick = interval(self.config.interval);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cleanup_tick = interval(self.config.cleanup_interval);
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval = ?self.config.interval,
            cleanup_interval = ?self.config.cleanup_interval,
            "scheduler started"
        );
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = sync_tick.tick() => self.sync_round().await,
                _ = cleanup_tick.tick() => self.cleanup_round().await,
            }
        }
        info!("scheduler stopped");
    }

    async fn sync_round(&self) {
        let runs: Vec<_> = self
            .engine
            .sites()
            .into_iter()
            .map(|site| {
                let engine = Arc::clone(&self.engine);
                (site, tokio::task::spawn_blocking(move || engine.run_incremental(site)))
            })
            .collect();

        for (site, run) in runs {
            match run.await {
                Ok(Ok(RunOutcome::Completed(report))) => debug!(
                    %site,
                    pushed = report.push.synced,
                    pulled = report.pull.applied,
                    "scheduled run done"
                ),
                Ok(Ok(RunOutcome::Skipped)) => debug!(%site, "scheduled run skipped"),
                Ok(Err(e)) => warn!(%site, error = %e, "scheduled run failed"),
                Err(e) => error!(%site, error = %e, "scheduled run panicked"),
            }
        }
    }

    async fn cleanup_round(&self) {
        for site in self.engine.sites() {
            let engine = Arc::clone(&self.engine);
            let retention = self.config.retention;
            match tokio::task::spawn_blocking(move || engine.cleanup(site, retention)).await {
                Ok(Ok(report)) => debug!(%site, deleted = report.deleted, "scheduled cleanup done"),
                Ok(Err(e)) => warn!(%site, error = %e, "scheduled cleanup failed"),
                Err(e) => error!(%site, error = %e, "scheduled cleanup panicked"),
            }
        }
    }
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the loop after the round in progress and waits for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "scheduler task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::transport::MockTransport;
    use sedesync_core::SiteNode;
    use sedesync_protocol::{PullResponse, Site, SiteCode, SiteId};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_each_site_until_shutdown() {
        let engine = Arc::new(SyncEngine::new(SyncConfig::default()));
        let node = Arc::new(SiteNode::in_memory(Site::new(SiteCode::Oriente, "Sede Oriente")));
        let transport = Arc::new(MockTransport::new());
        for _ in 0..50 {
            transport.queue_pull(Ok(PullResponse::new(vec![], 0, false)));
        }
        engine.register(Arc::clone(&node), SiteId::new(), transport.clone());

        let handle = Scheduler::new(
            Arc::clone(&engine),
            SchedulerConfig::new().with_interval(Duration::from_millis(20)),
        )
        .spawn();
        tokio::time::sleep(Duration::from_millis(90)).await;
        handle.shutdown().await;

        let runs = engine.status(node.id()).unwrap().stats.runs_completed;
        assert!(runs >= 2, "expected at least two runs, got {runs}");
        assert_eq!(transport.pull_requests().len() as u64, runs);
    }
}
