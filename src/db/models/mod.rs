use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub mod alert_models;
pub mod detection_models;
pub mod video_models;

pub use alert_models::{Alert, AlertDb, AlertStatus, AlertTransition, ManualAlert};
pub use detection_models::{BoundingBox, Detection, DetectionDb, DetectionType, RawDetection};
pub use video_models::{ProcessingStatus, Video, VideoDb, VideoMetadata, VideoTransition};

/// Ordinal urgency shared by detection severity and alert priority
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(crate::error::Error::Serialization(format!(
                "Unknown severity: {}",
                other
            ))),
        }
    }
}

/// GPS position attached to a video and copied onto its alerts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GpsCoordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsCoordinates {
    pub(crate) fn from_columns(latitude: Option<f64>, longitude: Option<f64>) -> Option<Self> {
        match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => Some(Self {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }
}
