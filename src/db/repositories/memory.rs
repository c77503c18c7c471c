use super::PatrolStore;
use crate::db::models::{
    Alert, AlertStatus, AlertTransition, Detection, ProcessingStatus, Video, VideoTransition,
};
use crate::error::Error;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    videos: HashMap<Uuid, Video>,
    detections: Vec<Detection>,
    alerts: HashMap<Uuid, Alert>,
}

/// Record store kept in process memory. Same compare-and-set semantics as the
/// PostgreSQL store; used for development and tests.
#[derive(Default)]
pub struct MemoryPatrolStore {
    state: RwLock<MemoryState>,
}

impl MemoryPatrolStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PatrolStore for MemoryPatrolStore {
    async fn insert_video(&self, video: &Video) -> Result<Video> {
        let mut state = self.state.write().await;
        if state.videos.contains_key(&video.id) {
            return Err(Error::Database(format!("Video already exists: {}", video.id)).into());
        }
        state.videos.insert(video.id, video.clone());
        Ok(video.clone())
    }

    async fn get_video(&self, id: &Uuid) -> Result<Option<Video>> {
        Ok(self.state.read().await.videos.get(id).cloned())
    }

    async fn list_videos(&self, limit: Option<i64>) -> Result<Vec<Video>> {
        let state = self.state.read().await;
        let mut videos: Vec<Video> = state.videos.values().cloned().collect();
        videos.sort_by(|a, b| b.upload_timestamp.cmp(&a.upload_timestamp));
        if let Some(limit) = limit {
            videos.truncate(limit.max(0) as usize);
        }
        Ok(videos)
    }

    async fn list_videos_by_status(&self, status: ProcessingStatus) -> Result<Vec<Video>> {
        let state = self.state.read().await;
        let mut videos: Vec<Video> = state
            .videos
            .values()
            .filter(|v| v.processing_status == status)
            .cloned()
            .collect();
        videos.sort_by(|a, b| a.upload_timestamp.cmp(&b.upload_timestamp));
        Ok(videos)
    }

    async fn transition_video(&self, id: &Uuid, transition: &VideoTransition) -> Result<Video> {
        let mut state = self.state.write().await;
        let video = state
            .videos
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Video not found: {}", id)))?;
        transition.apply(video, Utc::now())?;
        Ok(video.clone())
    }

    async fn complete_analysis(
        &self,
        id: &Uuid,
        claimed_at: DateTime<Utc>,
        detections: &[Detection],
        alerts: &[Alert],
    ) -> Result<Video> {
        let mut state = self.state.write().await;
        if let Some(alert) = alerts.iter().find(|a| state.alerts.contains_key(&a.id)) {
            return Err(Error::Database(format!("Alert already exists: {}", alert.id)).into());
        }

        let video = state
            .videos
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Video not found: {}", id)))?;
        VideoTransition::Complete { claimed_at }.apply(video, Utc::now())?;
        let video = video.clone();

        state.detections.extend_from_slice(detections);
        for alert in alerts {
            state.alerts.insert(alert.id, alert.clone());
        }
        Ok(video)
    }

    async fn list_detections(&self, video_id: Option<&Uuid>) -> Result<Vec<Detection>> {
        let state = self.state.read().await;
        Ok(state
            .detections
            .iter()
            .filter(|d| video_id.map_or(true, |id| &d.video_id == id))
            .cloned()
            .collect())
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<Alert> {
        let mut state = self.state.write().await;
        if state.alerts.contains_key(&alert.id) {
            return Err(Error::Database(format!("Alert already exists: {}", alert.id)).into());
        }
        state.alerts.insert(alert.id, alert.clone());
        Ok(alert.clone())
    }

    async fn get_alert(&self, id: &Uuid) -> Result<Option<Alert>> {
        Ok(self.state.read().await.alerts.get(id).cloned())
    }

    async fn list_alerts(&self, status: Option<AlertStatus>) -> Result<Vec<Alert>> {
        let state = self.state.read().await;
        let mut alerts: Vec<Alert> = state
            .alerts
            .values()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(alerts)
    }

    async fn transition_alert(&self, id: &Uuid, transition: &AlertTransition) -> Result<Alert> {
        let mut state = self.state.write().await;
        let alert = state
            .alerts
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Alert not found: {}", id)))?;
        transition.apply(alert, Utc::now())?;
        Ok(alert.clone())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{RawDetection, VideoMetadata};
    use crate::services::alert_deriver::{build_detection, derive};

    fn video() -> Video {
        Video::new_pending(
            Uuid::new_v4(),
            "sector-7.mp4",
            10,
            "video/mp4",
            "file:///videos/sector-7.mp4".into(),
            VideoMetadata::default(),
        )
    }

    #[tokio::test]
    async fn completing_a_pending_video_is_rejected_and_stores_nothing() -> Result<()> {
        let store = MemoryPatrolStore::new();
        let video = store.insert_video(&video()).await?;

        let err = store
            .complete_analysis(&video.id, Utc::now(), &[], &[])
            .await
            .unwrap_err();
        assert!(Error::is_invalid_transition(&err));
        assert!(store.list_detections(Some(&video.id)).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn completion_stores_detections_and_alerts_together() -> Result<()> {
        let store = MemoryPatrolStore::new();
        let video = store.insert_video(&video()).await?;
        let claimed = store
            .transition_video(&video.id, &VideoTransition::Claim)
            .await?;
        let claimed_at = claimed.processing_started_at.unwrap();

        let detection = build_detection(video.id, &RawDetection::new("fire", 0.95)).unwrap();
        let alert = derive(&detection, &claimed).unwrap();
        let taken = store.insert_alert(&alert).await?;

        // A clashing alert leaves the video processing and writes nothing
        let err = store
            .complete_analysis(&video.id, claimed_at, &[detection.clone()], &[taken])
            .await
            .unwrap_err();
        assert!(matches!(Error::find(&err), Some(Error::Database(_))));
        assert!(store.list_detections(None).await?.is_empty());
        let current = store.get_video(&video.id).await?.unwrap();
        assert_eq!(current.processing_status, ProcessingStatus::Processing);

        let fresh = derive(&detection, &claimed).unwrap();
        let completed = store
            .complete_analysis(&video.id, claimed_at, &[detection], &[fresh.clone()])
            .await?;
        assert_eq!(completed.processing_status, ProcessingStatus::Completed);
        assert_eq!(store.list_detections(Some(&video.id)).await?.len(), 1);
        assert!(store.get_alert(&fresh.id).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn listings_are_not_capped() -> Result<()> {
        let store = MemoryPatrolStore::new();
        for _ in 0..150 {
            store.insert_video(&video()).await?;
        }
        assert_eq!(store.list_videos(None).await?.len(), 150);
        assert_eq!(store.list_videos(Some(20)).await?.len(), 20);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() -> Result<()> {
        let store = MemoryPatrolStore::new();
        let err = store
            .transition_video(&Uuid::new_v4(), &VideoTransition::Claim)
            .await
            .unwrap_err();
        assert!(Error::is_not_found(&err));

        let err = store
            .transition_alert(
                &Uuid::new_v4(),
                &AlertTransition::Acknowledge {
                    actor: "ops".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(Error::is_not_found(&err));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_video_ids_are_refused() -> Result<()> {
        let store = MemoryPatrolStore::new();
        let video = video();
        store.insert_video(&video).await?;
        assert!(store.insert_video(&video).await.is_err());
        Ok(())
    }
}
