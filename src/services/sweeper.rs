use crate::config::AnalysisConfig;
use crate::db::models::ProcessingStatus;
use crate::db::repositories::PatrolStore;
use crate::error::Error;
use crate::services::analysis::AnalysisOrchestrator;
use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

pub const STALE_REASON: &str = "analysis timed out";

/// Periodically fails videos that have been `processing` for too long, e.g. because the
/// process analysing them died.
pub struct StaleAnalysisSweeper {
    store: Arc<dyn PatrolStore>,
    orchestrator: Arc<AnalysisOrchestrator>,
    interval_secs: u64,
    stale_after: chrono::Duration,
}

impl StaleAnalysisSweeper {
    pub fn new(
        store: Arc<dyn PatrolStore>,
        orchestrator: Arc<AnalysisOrchestrator>,
        config: &AnalysisConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            interval_secs: config.sweep_interval_secs.max(1),
            stale_after: chrono::Duration::seconds(config.stale_after_secs as i64),
        }
    }

    /// Start the sweeper in the background
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        info!(
            "Starting stale analysis sweeper with interval of {} seconds",
            self.interval_secs
        );

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(self.interval_secs));

            loop {
                interval.tick().await;

                if let Err(e) = self.sweep().await {
                    error!("Error sweeping stale analyses: {}", e);
                }
            }
        })
    }

    /// Fail every stale `processing` video. Returns how many were failed.
    pub async fn sweep(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.stale_after;
        let processing = self
            .store
            .list_videos_by_status(ProcessingStatus::Processing)
            .await?;

        let mut failed = 0;
        for video in processing {
            let Some(claimed_at) = video.processing_started_at else {
                warn!("Video {} is processing without a claim time", video.id);
                continue;
            };
            if claimed_at > cutoff {
                continue;
            }

            match self.orchestrator.fail(&video.id, claimed_at, STALE_REASON).await {
                Ok(_) => failed += 1,
                // Finished or reclaimed between the listing and now
                Err(e) if Error::is_invalid_transition(&e) => {
                    debug!("Video {} left processing before the sweep", video.id)
                }
                Err(e) => return Err(e),
            }
        }

        if failed > 0 {
            info!("Failed {} stale analyses", failed);
        }
        Ok(failed)
    }
}
