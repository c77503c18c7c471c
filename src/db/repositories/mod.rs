use crate::db::models::{
    Alert, AlertStatus, AlertTransition, Detection, ProcessingStatus, Video, VideoTransition,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

pub mod alerts;
pub mod detections;
pub mod memory;
pub mod videos;

pub use alerts::AlertsRepository;
pub use detections::DetectionsRepository;
pub use memory::MemoryPatrolStore;
pub use videos::VideosRepository;

/// Patrol record store: the single source of truth for videos, detections and alerts.
///
/// Conditional updates (`transition_video`, `complete_analysis`, `transition_alert`) are
/// compare-and-set operations: they succeed only when the stored status is one the
/// transition allows, and fail with `Error::InvalidTransition` otherwise.
#[async_trait]
pub trait PatrolStore: Send + Sync {
    async fn insert_video(&self, video: &Video) -> Result<Video>;

    async fn get_video(&self, id: &Uuid) -> Result<Option<Video>>;

    /// Videos, newest upload first; `None` returns every video
    async fn list_videos(&self, limit: Option<i64>) -> Result<Vec<Video>>;

    async fn list_videos_by_status(&self, status: ProcessingStatus) -> Result<Vec<Video>>;

    async fn transition_video(&self, id: &Uuid, transition: &VideoTransition) -> Result<Video>;

    /// Persist all detections and the alerts derived from them, and move the video
    /// `processing -> completed`, in one step. Fails with `InvalidTransition` unless the
    /// video is still held by the claim that started at `claimed_at`.
    async fn complete_analysis(
        &self,
        id: &Uuid,
        claimed_at: DateTime<Utc>,
        detections: &[Detection],
        alerts: &[Alert],
    ) -> Result<Video>;

    /// Every detection, or those of one video
    async fn list_detections(&self, video_id: Option<&Uuid>) -> Result<Vec<Detection>>;

    async fn insert_alert(&self, alert: &Alert) -> Result<Alert>;

    async fn get_alert(&self, id: &Uuid) -> Result<Option<Alert>>;

    /// Every alert, newest first, optionally restricted to one status
    async fn list_alerts(&self, status: Option<AlertStatus>) -> Result<Vec<Alert>>;

    async fn transition_alert(&self, id: &Uuid, transition: &AlertTransition) -> Result<Alert>;

    async fn health_check(&self) -> Result<bool>;
}

/// PostgreSQL-backed store built from the per-table repositories
#[derive(Clone)]
pub struct PgPatrolStore {
    pool: Arc<PgPool>,
    videos: VideosRepository,
    detections: DetectionsRepository,
    alerts: AlertsRepository,
}

impl PgPatrolStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self {
            videos: VideosRepository::new(pool.clone()),
            detections: DetectionsRepository::new(pool.clone()),
            alerts: AlertsRepository::new(pool.clone()),
            pool,
        }
    }
}

#[async_trait]
impl PatrolStore for PgPatrolStore {
    async fn insert_video(&self, video: &Video) -> Result<Video> {
        self.videos.create(video).await
    }

    async fn get_video(&self, id: &Uuid) -> Result<Option<Video>> {
        self.videos.get_by_id(id).await
    }

    async fn list_videos(&self, limit: Option<i64>) -> Result<Vec<Video>> {
        self.videos.get_all(limit).await
    }

    async fn list_videos_by_status(&self, status: ProcessingStatus) -> Result<Vec<Video>> {
        self.videos.get_by_status(status).await
    }

    async fn transition_video(&self, id: &Uuid, transition: &VideoTransition) -> Result<Video> {
        self.videos.transition(id, transition).await
    }

    async fn complete_analysis(
        &self,
        id: &Uuid,
        claimed_at: DateTime<Utc>,
        detections: &[Detection],
        alerts: &[Alert],
    ) -> Result<Video> {
        self.videos
            .complete_with_results(id, claimed_at, detections, alerts)
            .await
    }

    async fn list_detections(&self, video_id: Option<&Uuid>) -> Result<Vec<Detection>> {
        match video_id {
            Some(video_id) => self.detections.get_by_video(video_id).await,
            None => self.detections.get_all().await,
        }
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<Alert> {
        self.alerts.create(alert).await
    }

    async fn get_alert(&self, id: &Uuid) -> Result<Option<Alert>> {
        self.alerts.get_by_id(id).await
    }

    async fn list_alerts(&self, status: Option<AlertStatus>) -> Result<Vec<Alert>> {
        self.alerts.get_all(status).await
    }

    async fn transition_alert(&self, id: &Uuid, transition: &AlertTransition) -> Result<Alert> {
        self.alerts.transition(id, transition).await
    }

    async fn health_check(&self) -> Result<bool> {
        match sqlx::query("SELECT 1").execute(&*self.pool).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::error!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }
}
