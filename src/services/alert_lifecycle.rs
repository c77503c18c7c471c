use crate::db::models::{Alert, AlertStatus, AlertTransition};
use crate::db::repositories::PatrolStore;
use crate::error::Error;
use crate::messaging::{ChangeEvent, EventType, RealtimeDistributor};
use crate::utils::{KeyedGuard, KeyedLocks};
use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use std::sync::Arc;
use uuid::Uuid;

/// Alert lifecycle manager: `active -> acknowledged -> resolved`, with `active -> resolved`
/// allowed.
///
/// Every mutation runs under the alert's lock and publishes its change before the lock is
/// released, so concurrent callers are serialized and losers see `InvalidTransition`.
pub struct AlertLifecycleManager {
    store: Arc<dyn PatrolStore>,
    distributor: RealtimeDistributor,
    locks: KeyedLocks,
}

impl AlertLifecycleManager {
    pub fn new(store: Arc<dyn PatrolStore>, distributor: RealtimeDistributor) -> Self {
        Self {
            store,
            distributor,
            locks: KeyedLocks::new(),
        }
    }

    /// Reset a new alert to a fresh `active` one
    pub fn fresh(mut alert: Alert) -> Result<Alert, Error> {
        if alert.title.trim().is_empty() {
            return Err(Error::Validation("Alert title must not be empty".to_string()));
        }

        let now = Utc::now();
        alert.status = AlertStatus::Active;
        alert.acknowledged_at = None;
        alert.acknowledged_by = None;
        alert.resolved_at = None;
        alert.resolved_by = None;
        alert.resolution_notes = None;
        alert.created_at = now;
        alert.updated_at = now;
        Ok(alert)
    }

    /// Persist a new alert as `active` and announce it
    pub async fn raise(&self, alert: Alert) -> Result<Alert> {
        let alert = Self::fresh(alert)?;

        let _guard = self.locks.lock(alert.id).await;
        let alert = self.store.insert_alert(&alert).await?;
        self.announce_raised(&alert);

        Ok(alert)
    }

    /// Lock alerts another component is about to store, so nothing about them is published
    /// before `announce_raised`
    pub async fn lock_new(&self, alerts: &[Alert]) -> Vec<KeyedGuard<'_>> {
        let mut guards = Vec::with_capacity(alerts.len());
        for alert in alerts {
            guards.push(self.locks.lock(alert.id).await);
        }
        guards
    }

    /// Announce an alert that was stored along with the analysis that derived it
    pub fn announce_raised(&self, alert: &Alert) {
        info!(
            "Raised {} alert {} ({})",
            alert.priority_level, alert.id, alert.alert_type
        );
        self.publish(EventType::AlertRaised, alert);
    }

    pub async fn acknowledge(&self, alert_id: &Uuid, actor: &str) -> Result<Alert> {
        self.transition(
            alert_id,
            AlertTransition::Acknowledge {
                actor: actor.to_string(),
            },
            EventType::AlertAcknowledged,
        )
        .await
    }

    pub async fn resolve(
        &self,
        alert_id: &Uuid,
        actor: &str,
        notes: Option<String>,
    ) -> Result<Alert> {
        let notes = notes.filter(|n| !n.trim().is_empty());
        self.transition(
            alert_id,
            AlertTransition::Resolve {
                actor: actor.to_string(),
                notes,
            },
            EventType::AlertResolved,
        )
        .await
    }

    async fn transition(
        &self,
        alert_id: &Uuid,
        transition: AlertTransition,
        event_type: EventType,
    ) -> Result<Alert> {
        let _guard = self.locks.lock(*alert_id).await;

        let alert = self.store.transition_alert(alert_id, &transition).await?;
        info!("Alert {} is now {}", alert.id, alert.status);
        self.publish(event_type, &alert);

        Ok(alert)
    }

    fn publish(&self, event_type: EventType, alert: &Alert) {
        match ChangeEvent::for_alert(event_type, alert) {
            Ok(event) => {
                self.distributor.publish(event);
            }
            Err(e) => warn!("Failed to encode {} for alert {}: {}", event_type, alert.id, e),
        }
    }
}
