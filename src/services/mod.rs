pub mod alert_deriver;
pub mod alert_lifecycle;
pub mod analysis;
pub mod ingestion;
pub mod sweeper;
#[cfg(test)]
mod tests;

pub use alert_lifecycle::AlertLifecycleManager;
pub use analysis::AnalysisOrchestrator;
pub use ingestion::IngestionManager;
pub use sweeper::StaleAnalysisSweeper;

use crate::config::Config;
use crate::db::repositories::PatrolStore;
use crate::detector::Detector;
use crate::messaging::RealtimeDistributor;
use crate::storage::BlobStore;
use anyhow::Result;
use log::info;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// The wired pipeline: one instance of every service, sharing the store and the
/// distributor.
pub struct Pipeline {
    pub store: Arc<dyn PatrolStore>,
    pub distributor: RealtimeDistributor,
    pub ingestion: IngestionManager,
    pub orchestrator: Arc<AnalysisOrchestrator>,
    pub alerts: Arc<AlertLifecycleManager>,
    pub sweeper: Arc<StaleAnalysisSweeper>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn PatrolStore>,
        blobs: Arc<dyn BlobStore>,
        detector: Arc<dyn Detector>,
        config: &Config,
    ) -> Self {
        let distributor = RealtimeDistributor::new(config.realtime.channel_capacity);
        let alerts = Arc::new(AlertLifecycleManager::new(
            store.clone(),
            distributor.clone(),
        ));
        let orchestrator = Arc::new(AnalysisOrchestrator::new(
            store.clone(),
            detector,
            alerts.clone(),
            distributor.clone(),
            &config.analysis,
        ));
        let ingestion = IngestionManager::new(
            store.clone(),
            blobs,
            orchestrator.clone(),
            distributor.clone(),
            config.storage.max_upload_bytes,
        );
        let sweeper = Arc::new(StaleAnalysisSweeper::new(
            store.clone(),
            orchestrator.clone(),
            &config.analysis,
        ));

        Self {
            store,
            distributor,
            ingestion,
            orchestrator,
            alerts,
            sweeper,
        }
    }

    /// Start the analysis workers and the sweeper, then pick up work left pending by a
    /// previous run.
    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>> {
        let workers = self.orchestrator.start().await?;
        let sweeper = self.sweeper.clone().start();

        let recovered = self.orchestrator.recover_pending().await?;
        info!("Pipeline started; {} videos recovered", recovered);

        Ok(vec![workers, sweeper])
    }
}
