use super::Severity;
use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Domain tag reported by the detector
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DetectionType {
    Fire,
    PestInfestation,
    AnimalIntrusion,
    PipelineDamage,
    Person,
    Vehicle,
    /// Any other tag, kept in normalised form
    Other(String),
}

impl DetectionType {
    /// Parse a detector tag. `Pipeline-Damage`, `pipeline damage` and `pipeline_damage`
    /// are the same tag.
    pub fn parse(tag: &str) -> Self {
        let normalised: String = tag
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect();

        match normalised.as_str() {
            "fire" => DetectionType::Fire,
            "pest_infestation" => DetectionType::PestInfestation,
            "animal_intrusion" => DetectionType::AnimalIntrusion,
            "pipeline_damage" => DetectionType::PipelineDamage,
            "person" => DetectionType::Person,
            "vehicle" => DetectionType::Vehicle,
            _ => DetectionType::Other(normalised),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DetectionType::Fire => "fire",
            DetectionType::PestInfestation => "pest_infestation",
            DetectionType::AnimalIntrusion => "animal_intrusion",
            DetectionType::PipelineDamage => "pipeline_damage",
            DetectionType::Person => "person",
            DetectionType::Vehicle => "vehicle",
            DetectionType::Other(tag) => tag,
        }
    }

    /// Human readable label, e.g. "Pipeline damage"
    pub fn label(&self) -> String {
        let spaced = self.as_str().replace('_', " ");
        let mut chars = spaced.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => "Unknown".to_string(),
        }
    }
}

impl Display for DetectionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for DetectionType {
    fn from(tag: String) -> Self {
        DetectionType::parse(&tag)
    }
}

impl From<DetectionType> for String {
    fn from(detection_type: DetectionType) -> Self {
        detection_type.as_str().to_string()
    }
}

/// Bounding box in frame coordinates, as reported by the detector
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// One tuple of detector output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawDetection {
    #[serde(rename = "type")]
    pub detection_type: String,
    pub confidence: f64,
    #[serde(default, alias = "timestamp")]
    pub timestamp_seconds: Option<f64>,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
}

impl RawDetection {
    pub fn new(detection_type: &str, confidence: f64) -> Self {
        Self {
            detection_type: detection_type.to_string(),
            confidence,
            timestamp_seconds: None,
            bbox: None,
        }
    }
}

/// Detection model. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub id: Uuid,
    pub video_id: Uuid,
    pub detection_type: DetectionType,
    pub confidence_score: f64,
    pub timestamp_in_video: Option<f64>,
    pub severity_level: Severity,
    pub requires_action: bool,
    pub description: String,
    pub bounding_box: Option<BoundingBox>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DetectionDb {
    pub id: Uuid,
    pub video_id: Uuid,
    pub detection_type: String,
    pub confidence_score: f64,
    pub timestamp_in_video: Option<f64>,
    pub severity_level: String,
    pub requires_action: bool,
    pub description: String,
    pub bounding_box: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DetectionDb> for Detection {
    type Error = Error;

    fn try_from(db: DetectionDb) -> Result<Self, Self::Error> {
        let bounding_box = db
            .bounding_box
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::Serialization(format!("Invalid bounding box: {}", e)))?;

        Ok(Self {
            id: db.id,
            video_id: db.video_id,
            detection_type: DetectionType::parse(&db.detection_type),
            confidence_score: db.confidence_score,
            timestamp_in_video: db.timestamp_in_video,
            severity_level: db.severity_level.parse()?,
            requires_action: db.requires_action,
            description: db.description,
            bounding_box,
            created_at: db.created_at,
        })
    }
}
