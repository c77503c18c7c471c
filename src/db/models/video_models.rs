use super::GpsCoordinates;
use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Processing status of an uploaded video
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    /// Stored, waiting for the orchestrator
    Pending,
    /// Claimed by exactly one analysis task
    Processing,
    /// Detector returned and detections were persisted
    Completed,
    /// Detector failed or timed out
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

impl Display for ProcessingStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(Error::Serialization(format!(
                "Unknown processing status: {}",
                other
            ))),
        }
    }
}

/// Advisory context supplied with an upload. Stored verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VideoMetadata {
    pub gps: Option<GpsCoordinates>,
    pub field_sector: Option<String>,
    pub weather_conditions: Option<serde_json::Value>,
}

/// Video model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Video {
    pub id: Uuid,
    pub filename: String,
    pub file_size: u64,
    pub content_type: String,
    pub storage_url: String,
    pub gps: Option<GpsCoordinates>,
    pub field_sector: Option<String>,
    pub weather_conditions: Option<serde_json::Value>,
    pub upload_timestamp: DateTime<Utc>,
    pub processing_status: ProcessingStatus,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Video {
    /// A freshly ingested video, waiting for analysis
    pub fn new_pending(
        id: Uuid,
        filename: &str,
        file_size: u64,
        content_type: &str,
        storage_url: String,
        metadata: VideoMetadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            filename: filename.to_string(),
            file_size,
            content_type: content_type.to_string(),
            storage_url,
            gps: metadata.gps,
            field_sector: metadata.field_sector,
            weather_conditions: metadata.weather_conditions,
            upload_timestamp: now,
            processing_status: ProcessingStatus::Pending,
            processing_started_at: None,
            completed_at: None,
            failure_reason: None,
            updated_at: now,
        }
    }
}

/// A status change the orchestrator may request
#[derive(Debug, Clone, PartialEq)]
pub enum VideoTransition {
    /// `pending -> processing`, the single authorization to run the detector
    Claim,
    /// `failed -> processing` after an external retry decision
    Retry,
    /// `processing -> completed`, only for the claim that started at `claimed_at`
    Complete { claimed_at: DateTime<Utc> },
    /// `processing -> failed`, only for the claim that started at `claimed_at`
    Fail {
        reason: String,
        claimed_at: DateTime<Utc>,
    },
}

impl VideoTransition {
    pub fn allowed_from(&self) -> &'static [ProcessingStatus] {
        match self {
            VideoTransition::Claim => &[ProcessingStatus::Pending],
            VideoTransition::Retry => &[ProcessingStatus::Failed],
            VideoTransition::Complete { .. } | VideoTransition::Fail { .. } => {
                &[ProcessingStatus::Processing]
            }
        }
    }

    pub fn target(&self) -> ProcessingStatus {
        match self {
            VideoTransition::Claim | VideoTransition::Retry => ProcessingStatus::Processing,
            VideoTransition::Complete { .. } => ProcessingStatus::Completed,
            VideoTransition::Fail { .. } => ProcessingStatus::Failed,
        }
    }

    /// Start time of the claim a finishing transition belongs to
    pub fn claimed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            VideoTransition::Complete { claimed_at } | VideoTransition::Fail { claimed_at, .. } => {
                Some(*claimed_at)
            }
            VideoTransition::Claim | VideoTransition::Retry => None,
        }
    }

    pub fn rejection(&self, video_id: &Uuid, current: ProcessingStatus) -> Error {
        Error::InvalidTransition {
            entity: "video",
            id: video_id.to_string(),
            from: current.to_string(),
            to: self.target().to_string(),
        }
    }

    /// The video was claimed again after the claim this transition belongs to
    pub fn superseded(&self, video_id: &Uuid) -> Error {
        Error::InvalidTransition {
            entity: "video",
            id: video_id.to_string(),
            from: "processing (claim superseded)".to_string(),
            to: self.target().to_string(),
        }
    }

    /// Apply the transition in place, refusing it when the current status does not allow it
    pub fn apply(&self, video: &mut Video, at: DateTime<Utc>) -> Result<(), Error> {
        if !self.allowed_from().contains(&video.processing_status) {
            return Err(self.rejection(&video.id, video.processing_status));
        }
        if let Some(claimed_at) = self.claimed_at() {
            if video.processing_started_at != Some(claimed_at) {
                return Err(self.superseded(&video.id));
            }
        }

        video.processing_status = self.target();
        video.updated_at = at;
        match self {
            VideoTransition::Claim | VideoTransition::Retry => {
                video.processing_started_at = Some(at);
                video.completed_at = None;
                video.failure_reason = None;
            }
            VideoTransition::Complete { .. } => {
                video.completed_at = Some(at);
            }
            VideoTransition::Fail { reason, .. } => {
                video.completed_at = Some(at);
                video.failure_reason = Some(reason.clone());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VideoDb {
    pub id: Uuid,
    pub filename: String,
    pub file_size: i64,
    pub content_type: String,
    pub storage_url: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub field_sector: Option<String>,
    pub weather_conditions: Option<serde_json::Value>,
    pub upload_timestamp: DateTime<Utc>,
    pub processing_status: String,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<VideoDb> for Video {
    type Error = Error;

    fn try_from(db: VideoDb) -> Result<Self, Self::Error> {
        Ok(Self {
            id: db.id,
            filename: db.filename,
            file_size: db.file_size.max(0) as u64,
            content_type: db.content_type,
            storage_url: db.storage_url,
            gps: GpsCoordinates::from_columns(db.latitude, db.longitude),
            field_sector: db.field_sector,
            weather_conditions: db.weather_conditions,
            upload_timestamp: db.upload_timestamp,
            processing_status: db.processing_status.parse()?,
            processing_started_at: db.processing_started_at,
            completed_at: db.completed_at,
            failure_reason: db.failure_reason,
            updated_at: db.updated_at,
        })
    }
}
