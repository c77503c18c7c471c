use crate::{
    db::models::{Alert, AlertDb, AlertStatus, AlertTransition},
    error::Error,
};
use anyhow::Result;
use chrono::Utc;
use sqlx::{Executor, PgPool, Postgres};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const ALERT_COLUMNS: &str = r#"
    id, detection_id, video_id, alert_type, priority_level, title, message, status,
    acknowledged_at, acknowledged_by, resolved_at, resolved_by, resolution_notes,
    latitude, longitude, action_required, created_at, updated_at
"#;

/// Alerts repository for handling alert operations
#[derive(Clone)]
pub struct AlertsRepository {
    pool: Arc<PgPool>,
}

impl AlertsRepository {
    /// Create a new alerts repository
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create a new alert
    pub async fn create(&self, alert: &Alert) -> Result<Alert> {
        insert_alert(&*self.pool, alert).await
    }

    /// Get alert by ID
    pub async fn get_by_id(&self, id: &Uuid) -> Result<Option<Alert>> {
        let sql = format!("SELECT {} FROM alerts WHERE id = $1", ALERT_COLUMNS);

        let result = sqlx::query_as::<_, AlertDb>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get alert by ID: {}", e)))?;

        Ok(result.map(Alert::try_from).transpose()?)
    }

    /// Get alerts, newest first, optionally filtered by status
    pub async fn get_all(&self, status: Option<AlertStatus>) -> Result<Vec<Alert>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM alerts
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC
            "#,
            ALERT_COLUMNS
        );

        let result = sqlx::query_as::<_, AlertDb>(&sql)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get alerts: {}", e)))?;

        result
            .into_iter()
            .map(|db| Alert::try_from(db).map_err(anyhow::Error::from))
            .collect()
    }

    /// Compare-and-set the alert status
    pub async fn transition(&self, id: &Uuid, transition: &AlertTransition) -> Result<Alert> {
        let now = Utc::now();
        let (acknowledged_at, acknowledged_by, resolved_at, resolved_by, notes) = match transition
        {
            AlertTransition::Acknowledge { actor } => {
                (Some(now), Some(actor.clone()), None, None, None)
            }
            AlertTransition::Resolve { actor, notes } => {
                (None, None, Some(now), Some(actor.clone()), notes.clone())
            }
        };

        let sql = format!(
            r#"
            UPDATE alerts
            SET status = $1,
                acknowledged_at = COALESCE($2, acknowledged_at),
                acknowledged_by = COALESCE($3, acknowledged_by),
                resolved_at = COALESCE($4, resolved_at),
                resolved_by = COALESCE($5, resolved_by),
                resolution_notes = COALESCE($6, resolution_notes),
                updated_at = $7
            WHERE id = $8 AND status = ANY($9)
            RETURNING {}
            "#,
            ALERT_COLUMNS
        );

        let allowed: Vec<String> = transition
            .allowed_from()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let result = sqlx::query_as::<_, AlertDb>(&sql)
            .bind(transition.target().as_str())
            .bind(acknowledged_at)
            .bind(acknowledged_by)
            .bind(resolved_at)
            .bind(resolved_by)
            .bind(notes)
            .bind(now)
            .bind(id)
            .bind(allowed)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to update alert status: {}", e)))?;

        if let Some(db) = result {
            return Ok(Alert::try_from(db)?);
        }

        let current: Option<String> = sqlx::query_scalar("SELECT status FROM alerts WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to read alert status: {}", e)))?;

        match current {
            Some(status) => Err(transition.rejection(id, status.parse()?).into()),
            None => Err(Error::NotFound(format!("Alert not found: {}", id)).into()),
        }
    }
}

/// Insert an alert through any executor, so analysis can write alerts inside its
/// completion transaction
pub(crate) async fn insert_alert<'e, E>(executor: E, alert: &Alert) -> Result<Alert>
where
    E: Executor<'e, Database = Postgres>,
{
    info!("Creating {} alert {} ({})", alert.priority_level, alert.id, alert.alert_type);

    let sql = format!(
        r#"
        INSERT INTO alerts (
            id, detection_id, video_id, alert_type, priority_level, title, message, status,
            acknowledged_at, acknowledged_by, resolved_at, resolved_by, resolution_notes,
            latitude, longitude, action_required, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        RETURNING {}
        "#,
        ALERT_COLUMNS
    );

    let result = sqlx::query_as::<_, AlertDb>(&sql)
        .bind(alert.id)
        .bind(alert.detection_id)
        .bind(alert.video_id)
        .bind(&alert.alert_type)
        .bind(alert.priority_level.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(alert.status.as_str())
        .bind(alert.acknowledged_at)
        .bind(&alert.acknowledged_by)
        .bind(alert.resolved_at)
        .bind(&alert.resolved_by)
        .bind(&alert.resolution_notes)
        .bind(alert.gps_location.map(|g| g.latitude))
        .bind(alert.gps_location.map(|g| g.longitude))
        .bind(&alert.action_required)
        .bind(alert.created_at)
        .bind(alert.updated_at)
        .fetch_one(executor)
        .await
        .map_err(|e| Error::Database(format!("Failed to create alert: {}", e)))?;

    Ok(Alert::try_from(result)?)
}
