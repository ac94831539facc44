use crate::config::UploadConfig;
use crate::services::upload_service::UploadService;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

/// Periodic cleanup of abandoned uploads and expired task outcomes.
pub struct MaintenanceWorker {
    uploads: UploadService,
    config: UploadConfig,
    shutdown: watch::Receiver<bool>,
}

/// What one sweep removed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub uploads: usize,
    pub outcomes: usize,
}

impl MaintenanceWorker {
    pub fn new(
        uploads: UploadService,
        config: UploadConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            uploads,
            config,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("🚀 Maintenance worker started");
        let interval = Duration::from_secs(self.config.maintenance_interval_secs.max(1));

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Maintenance worker shutting down");
                    break;
                }
                _ = sleep(interval) => {
                    self.perform_cleanup().await;
                }
            }
        }
    }

    pub async fn perform_cleanup(&self) -> SweepReport {
        tracing::info!("🧹 Running upload maintenance...");
        let mut report = SweepReport::default();

        // 1. Idle uploads and orphaned staging dirs
        match self
            .uploads
            .sweep_stale_uploads(self.config.staging_max_age())
            .await
        {
            Ok(n) => report.uploads = n,
            Err(e) => tracing::error!("Failed to sweep staging dirs: {}", e),
        }

        // 2. Outcomes nobody asked about in time
        report.outcomes = self
            .uploads
            .queue()
            .prune_outcomes(self.config.outcome_retention());

        tracing::info!(
            "✅ Maintenance done: {} uploads, {} outcomes removed",
            report.uploads,
            report.outcomes
        );
        report
    }
}
