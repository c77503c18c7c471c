use super::{GpsCoordinates, Severity};
use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Alert lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }
}

impl Display for AlertStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AlertStatus::Active),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "resolved" => Ok(AlertStatus::Resolved),
            other => Err(Error::Serialization(format!(
                "Unknown alert status: {}",
                other
            ))),
        }
    }
}

/// Alert model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: Uuid,
    /// Weak reference; the detection may be purged without invalidating the alert
    pub detection_id: Option<Uuid>,
    pub video_id: Option<Uuid>,
    pub alert_type: String,
    pub priority_level: Severity,
    pub title: String,
    pub message: String,
    pub status: AlertStatus,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub gps_location: Option<GpsCoordinates>,
    pub action_required: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operator-raised alert without a detection behind it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualAlert {
    pub alert_type: String,
    pub priority_level: Severity,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub gps_location: Option<GpsCoordinates>,
    #[serde(default)]
    pub action_required: Option<String>,
}

impl From<ManualAlert> for Alert {
    fn from(manual: ManualAlert) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            detection_id: None,
            video_id: None,
            alert_type: manual.alert_type,
            priority_level: manual.priority_level,
            title: manual.title,
            message: manual.message,
            status: AlertStatus::Active,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            gps_location: manual.gps_location,
            action_required: manual.action_required,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A guarded alert status change
#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    Acknowledge {
        actor: String,
    },
    Resolve {
        actor: String,
        notes: Option<String>,
    },
}

impl AlertTransition {
    pub fn allowed_from(&self) -> &'static [AlertStatus] {
        match self {
            AlertTransition::Acknowledge { .. } => &[AlertStatus::Active],
            AlertTransition::Resolve { .. } => &[AlertStatus::Active, AlertStatus::Acknowledged],
        }
    }

    pub fn target(&self) -> AlertStatus {
        match self {
            AlertTransition::Acknowledge { .. } => AlertStatus::Acknowledged,
            AlertTransition::Resolve { .. } => AlertStatus::Resolved,
        }
    }

    pub fn rejection(&self, alert_id: &Uuid, current: AlertStatus) -> Error {
        Error::InvalidTransition {
            entity: "alert",
            id: alert_id.to_string(),
            from: current.to_string(),
            to: self.target().to_string(),
        }
    }

    /// Apply the transition in place. Timestamps are only ever written here, once.
    pub fn apply(&self, alert: &mut Alert, at: DateTime<Utc>) -> Result<(), Error> {
        if !self.allowed_from().contains(&alert.status) {
            return Err(self.rejection(&alert.id, alert.status));
        }

        alert.status = self.target();
        alert.updated_at = at;
        match self {
            AlertTransition::Acknowledge { actor } => {
                alert.acknowledged_at = Some(at);
                alert.acknowledged_by = Some(actor.clone());
            }
            AlertTransition::Resolve { actor, notes } => {
                alert.resolved_at = Some(at);
                alert.resolved_by = Some(actor.clone());
                alert.resolution_notes = notes.clone();
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertDb {
    pub id: Uuid,
    pub detection_id: Option<Uuid>,
    pub video_id: Option<Uuid>,
    pub alert_type: String,
    pub priority_level: String,
    pub title: String,
    pub message: String,
    pub status: String,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub action_required: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<AlertDb> for Alert {
    type Error = Error;

    fn try_from(db: AlertDb) -> Result<Self, Self::Error> {
        Ok(Self {
            id: db.id,
            detection_id: db.detection_id,
            video_id: db.video_id,
            alert_type: db.alert_type,
            priority_level: db.priority_level.parse()?,
            title: db.title,
            message: db.message,
            status: db.status.parse()?,
            acknowledged_at: db.acknowledged_at,
            acknowledged_by: db.acknowledged_by,
            resolved_at: db.resolved_at,
            resolved_by: db.resolved_by,
            resolution_notes: db.resolution_notes,
            gps_location: GpsCoordinates::from_columns(db.latitude, db.longitude),
            action_required: db.action_required,
            created_at: db.created_at,
            updated_at: db.updated_at,
        })
    }
}
