use crate::{
    db::models::{Detection, DetectionDb},
    error::Error,
};
use anyhow::Result;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use uuid::Uuid;

const DETECTION_COLUMNS: &str = r#"
    id, video_id, detection_type, confidence_score, timestamp_in_video,
    severity_level, requires_action, description, bounding_box, created_at
"#;

/// Detections repository. Detections are written once, inside the analysis
/// transaction, and only read afterwards.
#[derive(Clone)]
pub struct DetectionsRepository {
    pool: Arc<PgPool>,
}

impl DetectionsRepository {
    /// Create a new detections repository
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Get detections for a video in playback order
    pub async fn get_by_video(&self, video_id: &Uuid) -> Result<Vec<Detection>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM detections
            WHERE video_id = $1
            ORDER BY timestamp_in_video ASC NULLS LAST, created_at ASC
            "#,
            DETECTION_COLUMNS
        );

        let result = sqlx::query_as::<_, DetectionDb>(&sql)
            .bind(video_id)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get detections for video: {}", e)))?;

        into_detections(result)
    }

    /// Get every detection across all videos, newest first
    pub async fn get_all(&self) -> Result<Vec<Detection>> {
        let sql = format!(
            "SELECT {} FROM detections ORDER BY created_at DESC",
            DETECTION_COLUMNS
        );

        let result = sqlx::query_as::<_, DetectionDb>(&sql)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get detections: {}", e)))?;

        into_detections(result)
    }
}

/// Insert a detection as part of an open transaction
pub(crate) async fn insert_detection(
    tx: &mut Transaction<'_, Postgres>,
    detection: &Detection,
) -> Result<()> {
    let bounding_box = detection
        .bounding_box
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| Error::Serialization(format!("Invalid bounding box: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO detections (
            id, video_id, detection_type, confidence_score, timestamp_in_video,
            severity_level, requires_action, description, bounding_box, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(detection.id)
    .bind(detection.video_id)
    .bind(detection.detection_type.as_str())
    .bind(detection.confidence_score)
    .bind(detection.timestamp_in_video)
    .bind(detection.severity_level.as_str())
    .bind(detection.requires_action)
    .bind(&detection.description)
    .bind(bounding_box)
    .bind(detection.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| Error::Database(format!("Failed to create detection: {}", e)))?;

    Ok(())
}

fn into_detections(rows: Vec<DetectionDb>) -> Result<Vec<Detection>> {
    rows.into_iter()
        .map(|db| Detection::try_from(db).map_err(anyhow::Error::from))
        .collect()
}
