use crate::{
    db::models::{Alert, Detection, ProcessingStatus, Video, VideoDb, VideoTransition},
    db::repositories::{alerts::insert_alert, detections},
    error::Error,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const VIDEO_COLUMNS: &str = r#"
    id, filename, file_size, content_type, storage_url, latitude, longitude,
    field_sector, weather_conditions, upload_timestamp, processing_status,
    processing_started_at, completed_at, failure_reason, updated_at
"#;

/// Videos repository for handling video operations
#[derive(Clone)]
pub struct VideosRepository {
    pool: Arc<PgPool>,
}

impl VideosRepository {
    /// Create a new videos repository
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create a new video
    pub async fn create(&self, video: &Video) -> Result<Video> {
        info!("Creating video record {} ({})", video.id, video.filename);

        let sql = format!(
            r#"
            INSERT INTO videos (
                id, filename, file_size, content_type, storage_url, latitude, longitude,
                field_sector, weather_conditions, upload_timestamp, processing_status,
                processing_started_at, completed_at, failure_reason, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {}
            "#,
            VIDEO_COLUMNS
        );

        let result = sqlx::query_as::<_, VideoDb>(&sql)
            .bind(video.id)
            .bind(&video.filename)
            .bind(video.file_size as i64)
            .bind(&video.content_type)
            .bind(&video.storage_url)
            .bind(video.gps.map(|g| g.latitude))
            .bind(video.gps.map(|g| g.longitude))
            .bind(&video.field_sector)
            .bind(&video.weather_conditions)
            .bind(video.upload_timestamp)
            .bind(video.processing_status.as_str())
            .bind(video.processing_started_at)
            .bind(video.completed_at)
            .bind(&video.failure_reason)
            .bind(video.updated_at)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to create video: {}", e)))?;

        Ok(Video::try_from(result)?)
    }

    /// Get video by ID
    pub async fn get_by_id(&self, id: &Uuid) -> Result<Option<Video>> {
        let sql = format!("SELECT {} FROM videos WHERE id = $1", VIDEO_COLUMNS);

        let result = sqlx::query_as::<_, VideoDb>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get video by ID: {}", e)))?;

        Ok(result.map(Video::try_from).transpose()?)
    }

    /// Get videos, newest first; without a limit every video is returned
    pub async fn get_all(&self, limit: Option<i64>) -> Result<Vec<Video>> {
        let sql = format!(
            "SELECT {} FROM videos ORDER BY upload_timestamp DESC LIMIT $1",
            VIDEO_COLUMNS
        );

        let result = sqlx::query_as::<_, VideoDb>(&sql)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get videos: {}", e)))?;

        result
            .into_iter()
            .map(|db| Video::try_from(db).map_err(anyhow::Error::from))
            .collect()
    }

    /// Get videos with a given processing status, oldest first
    pub async fn get_by_status(&self, status: ProcessingStatus) -> Result<Vec<Video>> {
        let sql = format!(
            "SELECT {} FROM videos WHERE processing_status = $1 ORDER BY upload_timestamp ASC",
            VIDEO_COLUMNS
        );

        let result = sqlx::query_as::<_, VideoDb>(&sql)
            .bind(status.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get videos by status: {}", e)))?;

        result
            .into_iter()
            .map(|db| Video::try_from(db).map_err(anyhow::Error::from))
            .collect()
    }

    /// Compare-and-set the processing status
    pub async fn transition(&self, id: &Uuid, transition: &VideoTransition) -> Result<Video> {
        let now = Utc::now();
        let (started_at, completed_at, failure_reason) = match transition {
            VideoTransition::Claim | VideoTransition::Retry => (Some(now), None, None),
            VideoTransition::Complete { .. } => (None, Some(now), None),
            VideoTransition::Fail { reason, .. } => (None, Some(now), Some(reason.clone())),
        };

        let sql = format!(
            r#"
            UPDATE videos
            SET processing_status = $1,
                processing_started_at = COALESCE($2, processing_started_at),
                completed_at = $3,
                failure_reason = $4,
                updated_at = $5
            WHERE id = $6
              AND processing_status = ANY($7)
              AND ($8::TIMESTAMPTZ IS NULL OR processing_started_at = $8)
            RETURNING {}
            "#,
            VIDEO_COLUMNS
        );

        let result = sqlx::query_as::<_, VideoDb>(&sql)
            .bind(transition.target().as_str())
            .bind(started_at)
            .bind(completed_at)
            .bind(failure_reason)
            .bind(now)
            .bind(id)
            .bind(status_names(transition.allowed_from()))
            .bind(transition.claimed_at())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to update video status: {}", e)))?;

        match result {
            Some(db) => Ok(Video::try_from(db)?),
            None => Err(self.rejection(id, transition).await),
        }
    }

    /// Insert detections and their alerts and mark the video completed inside one
    /// transaction
    pub async fn complete_with_results(
        &self,
        id: &Uuid,
        claimed_at: DateTime<Utc>,
        detections: &[Detection],
        alerts: &[Alert],
    ) -> Result<Video> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        let now = Utc::now();
        let sql = format!(
            r#"
            UPDATE videos
            SET processing_status = 'completed', completed_at = $1, updated_at = $1
            WHERE id = $2 AND processing_status = 'processing' AND processing_started_at = $3
            RETURNING {}
            "#,
            VIDEO_COLUMNS
        );

        let updated = sqlx::query_as::<_, VideoDb>(&sql)
            .bind(now)
            .bind(id)
            .bind(claimed_at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to complete video: {}", e)))?;

        let Some(updated) = updated else {
            tx.rollback().await.ok();
            return Err(self
                .rejection(id, &VideoTransition::Complete { claimed_at })
                .await);
        };

        for detection in detections {
            detections::insert_detection(&mut tx, detection).await?;
        }
        for alert in alerts {
            insert_alert(&mut *tx, alert).await?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit analysis: {}", e)))?;

        debug!(
            "Video {} completed with {} detections and {} alerts",
            id,
            detections.len(),
            alerts.len()
        );

        Ok(Video::try_from(updated)?)
    }

    /// Work out why a conditional update matched no row
    async fn rejection(&self, id: &Uuid, transition: &VideoTransition) -> anyhow::Error {
        let current: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT processing_status FROM videos WHERE id = $1")
                .bind(id)
                .fetch_optional(&*self.pool)
                .await;

        match current {
            Ok(Some(status)) => match status.parse::<ProcessingStatus>() {
                Ok(status) if transition.allowed_from().contains(&status) => {
                    transition.superseded(id).into()
                }
                Ok(status) => transition.rejection(id, status).into(),
                Err(e) => e.into(),
            },
            Ok(None) => Error::NotFound(format!("Video not found: {}", id)).into(),
            Err(e) => Error::Database(format!("Failed to read video status: {}", e)).into(),
        }
    }
}

fn status_names(statuses: &[ProcessingStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}
