use crate::api::rest::{ApiResult, AppState};
use crate::db::models::{Alert, Detection, Video};
use crate::db::repositories::PatrolStore;
use crate::messaging::{ChangeEvent, Delivery, Table, TableFilter};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures::{
    sink::{Sink, SinkExt},
    stream::StreamExt,
};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

#[derive(Debug, Default, Deserialize)]
pub struct ChangesQuery {
    /// Comma separated table names; empty means every table
    pub tables: Option<String>,
    /// Send the current rows of the followed tables before live events
    #[serde(default)]
    pub snapshot: bool,
}

/// Messages pushed to change feed clients
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot {
        #[serde(skip_serializing_if = "Option::is_none")]
        videos: Option<Vec<Video>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detections: Option<Vec<Detection>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        alerts: Option<Vec<Alert>>,
    },
    Change {
        event: ChangeEvent,
    },
    /// Events were dropped for this client; re-read state through the REST API
    ResyncRequired {
        missed: u64,
    },
}

impl From<Delivery> for ServerMessage {
    fn from(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Change(event) => ServerMessage::Change {
                event: (*event).clone(),
            },
            Delivery::ResyncRequired { missed } => ServerMessage::ResyncRequired { missed },
        }
    }
}

/// Current rows of the followed tables
async fn snapshot(store: &dyn PatrolStore, filter: &TableFilter) -> Result<ServerMessage> {
    let mut videos = None;
    let mut detections = None;
    let mut alerts = None;

    for table in filter.tables() {
        match table {
            Table::Videos => videos = Some(store.list_videos(None).await?),
            Table::Detections => detections = Some(store.list_detections(None).await?),
            Table::Alerts => alerts = Some(store.list_alerts(None).await?),
        }
    }

    Ok(ServerMessage::Snapshot {
        videos,
        detections,
        alerts,
    })
}

// Handle WebSocket connection upgrade
pub async fn changes_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ChangesQuery>,
) -> ApiResult<Response> {
    let filter = TableFilter::parse(query.tables.as_deref().unwrap_or_default())?;
    let with_snapshot = query.snapshot;

    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, filter, with_snapshot))
        .into_response())
}

// Handle WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    filter: TableFilter,
    with_snapshot: bool,
) {
    // Subscribe before reading the snapshot so no change falls between the two;
    // clients apply events idempotently, so overlap is harmless
    let mut subscription = state.pipeline.distributor.subscribe(filter.clone());
    info!("Change feed client connected (tables: {:?})", filter.tables());

    let (mut sender, mut receiver) = socket.split();

    if with_snapshot {
        let message = match snapshot(state.pipeline.store.as_ref(), &filter).await {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to build snapshot: {}", e);
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
        };
        if let Err(e) = send_json(&mut sender, &message).await {
            error!("Failed to send snapshot: {}", e);
            return;
        }
    }

    // Task to forward changes to the client
    let sender_task = tokio::spawn(async move {
        while let Some(delivery) = subscription.recv().await {
            let message = ServerMessage::from(delivery);
            if let Err(e) = send_json(&mut sender, &message).await {
                debug!("Change feed client went away: {}", e);
                break;
            }
        }
    });

    // Task to watch the client side of the connection
    let receiver_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Close(_) => {
                    info!("Client closed the connection");
                    break;
                }
                // Pings are answered by axum; the feed takes no commands
                Message::Text(text) => debug!("Ignoring client message: {}", text),
                _ => {}
            }
        }
    });

    first_to_finish(sender_task, receiver_task).await;

    info!("Change feed connection closed");
}

/// Wait for either task to finish and cancel the other, so the subscription held by the
/// sender goes away with the connection
async fn first_to_finish(mut sender_task: JoinHandle<()>, mut receiver_task: JoinHandle<()>) {
    let remaining = tokio::select! {
        _ = &mut sender_task => {
            debug!("Sender task completed");
            receiver_task
        }
        _ = &mut receiver_task => {
            debug!("Receiver task completed");
            sender_task
        }
    };

    remaining.abort();
    let _ = remaining.await;
}

async fn send_json<S>(sender: &mut S, message: &ServerMessage) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = serde_json::to_string(message)?;
    sender.send(Message::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ManualAlert, Severity};
    use crate::db::repositories::MemoryPatrolStore;
    use crate::messaging::EventType;
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn messages_are_tagged() {
        let resync = serde_json::to_value(ServerMessage::ResyncRequired { missed: 4 }).unwrap();
        assert_eq!(resync["type"], "resync_required");
        assert_eq!(resync["missed"], 4);

        let event = ChangeEvent::new(
            EventType::VideoCompleted,
            Uuid::new_v4(),
            Utc::now(),
            &serde_json::json!({"processing_status": "completed"}),
        )
        .unwrap();
        let change = serde_json::to_value(ServerMessage::from(Delivery::Change(Arc::new(event))))
            .unwrap();
        assert_eq!(change["type"], "change");
        assert_eq!(change["event"]["event_type"], "video.completed");
        assert_eq!(change["event"]["table"], "videos");
    }

    #[tokio::test]
    async fn closing_one_side_releases_the_subscription() {
        let distributor = crate::messaging::RealtimeDistributor::new(8);
        let mut subscription = distributor.subscribe(TableFilter::all());
        assert_eq!(distributor.subscriber_count(), 1);

        // Nothing is ever published, so the sender side would wait forever
        let sender_task = tokio::spawn(async move { while subscription.recv().await.is_some() {} });
        let receiver_task = tokio::spawn(async {});

        first_to_finish(sender_task, receiver_task).await;
        assert_eq!(distributor.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn snapshot_only_includes_followed_tables() -> Result<()> {
        let store = MemoryPatrolStore::new();
        let alert: Alert = ManualAlert {
            alert_type: "fire".to_string(),
            priority_level: Severity::Critical,
            title: "Fire detected".to_string(),
            message: "Smoke over sector 3".to_string(),
            gps_location: None,
            action_required: None,
        }
        .into();
        store.insert_alert(&alert).await?;

        let message = snapshot(&store, &TableFilter::only([Table::Alerts])).await?;
        let json = serde_json::to_value(&message)?;
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["alerts"].as_array().map(Vec::len), Some(1));
        assert!(json.get("videos").is_none());
        Ok(())
    }
}
