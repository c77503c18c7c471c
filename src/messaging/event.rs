use crate::db::models::{Alert, Detection, Video};
use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Record tables a subscriber can follow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Videos,
    Detections,
    Alerts,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Videos, Table::Detections, Table::Alerts];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Videos => "videos",
            Table::Detections => "detections",
            Table::Alerts => "alerts",
        }
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "videos" | "video" => Ok(Table::Videos),
            "detections" | "detection" => Ok(Table::Detections),
            "alerts" | "alert" => Ok(Table::Alerts),
            other => Err(Error::Validation(format!("Unknown table: {}", other))),
        }
    }
}

/// Whether the change created the record or modified it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
}

/// Event types emitted by the pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    // Video events
    #[serde(rename = "video.ingested")]
    VideoIngested,
    #[serde(rename = "video.processing_started")]
    VideoProcessingStarted,
    #[serde(rename = "video.completed")]
    VideoCompleted,
    #[serde(rename = "analysis.failed")]
    AnalysisFailed,

    // Detection events
    #[serde(rename = "detection.recorded")]
    DetectionRecorded,

    // Alert events
    #[serde(rename = "alert.raised")]
    AlertRaised,
    #[serde(rename = "alert.acknowledged")]
    AlertAcknowledged,
    #[serde(rename = "alert.resolved")]
    AlertResolved,
}

impl EventType {
    pub fn table(&self) -> Table {
        match self {
            Self::VideoIngested
            | Self::VideoProcessingStarted
            | Self::VideoCompleted
            | Self::AnalysisFailed => Table::Videos,
            Self::DetectionRecorded => Table::Detections,
            Self::AlertRaised | Self::AlertAcknowledged | Self::AlertResolved => Table::Alerts,
        }
    }

    pub fn op(&self) -> ChangeOp {
        match self {
            Self::VideoIngested | Self::DetectionRecorded | Self::AlertRaised => ChangeOp::Insert,
            _ => ChangeOp::Update,
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VideoIngested => write!(f, "video.ingested"),
            Self::VideoProcessingStarted => write!(f, "video.processing_started"),
            Self::VideoCompleted => write!(f, "video.completed"),
            Self::AnalysisFailed => write!(f, "analysis.failed"),
            Self::DetectionRecorded => write!(f, "detection.recorded"),
            Self::AlertRaised => write!(f, "alert.raised"),
            Self::AlertAcknowledged => write!(f, "alert.acknowledged"),
            Self::AlertResolved => write!(f, "alert.resolved"),
        }
    }
}

/// A committed record change, as delivered to subscribers.
///
/// Clients apply events idempotently keyed by `(record_id, updated_at)`; the payload is
/// the full record after the change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Unique event ID
    pub id: Uuid,
    pub event_type: EventType,
    pub table: Table,
    pub op: ChangeOp,
    pub record_id: Uuid,
    /// Commit time of the record version carried in `payload`
    pub updated_at: DateTime<Utc>,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl ChangeEvent {
    /// Create a new change event
    pub fn new<T: Serialize>(
        event_type: EventType,
        record_id: Uuid,
        updated_at: DateTime<Utc>,
        record: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type,
            table: event_type.table(),
            op: event_type.op(),
            record_id,
            updated_at,
            timestamp: Utc::now(),
            payload: serde_json::to_value(record)?,
        })
    }

    pub fn for_video(event_type: EventType, video: &Video) -> Result<Self, serde_json::Error> {
        Self::new(event_type, video.id, video.updated_at, video)
    }

    pub fn for_detection(detection: &Detection) -> Result<Self, serde_json::Error> {
        Self::new(
            EventType::DetectionRecorded,
            detection.id,
            detection.created_at,
            detection,
        )
    }

    pub fn for_alert(event_type: EventType, alert: &Alert) -> Result<Self, serde_json::Error> {
        Self::new(event_type, alert.id, alert.updated_at, alert)
    }

    /// Get the routing key for the event
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.event_type, self.record_id)
    }
}
