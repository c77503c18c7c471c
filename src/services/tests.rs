//! Pipeline scenarios run against the in-process store, a temporary blob directory and
//! scripted detectors.

use super::Pipeline;
use crate::config::Config;
use crate::db::models::{
    Alert, AlertStatus, AlertTransition, Detection, ProcessingStatus, RawDetection, Severity,
    Video, VideoMetadata, VideoTransition,
};
use crate::db::repositories::{MemoryPatrolStore, PatrolStore};
use crate::detector::Detector;
use crate::error::Error;
use crate::messaging::{Delivery, EventType, Subscription, TableFilter};
use crate::services::sweeper::STALE_REASON;
use crate::storage::LocalBlobStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

#[derive(Clone)]
enum Script {
    Detections(Vec<RawDetection>),
    Fail(&'static str),
    Hang,
}

/// Detector answering from a script; the last entry repeats
struct ScriptedDetector {
    script: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<Uuid>>,
}

impl ScriptedDetector {
    fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls_for(&self, video_id: &Uuid) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == video_id)
            .count()
    }
}

#[async_trait]
impl Detector for ScriptedDetector {
    async fn analyze(&self, video_id: Uuid, video_url: &str) -> Result<Vec<RawDetection>> {
        assert!(!video_url.is_empty());
        self.calls.lock().unwrap().push(video_id);

        let step = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        };

        match step {
            Script::Detections(detections) => Ok(detections),
            Script::Fail(reason) => Err(Error::Detector(reason.to_string()).into()),
            Script::Hang => {
                sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
        }
    }
}

/// Store wrapper injecting write failures
#[derive(Default)]
struct FaultyStore {
    inner: MemoryPatrolStore,
    reject_video_inserts: bool,
    reject_alert_inserts: bool,
    failing_completions: AtomicUsize,
}

#[async_trait]
impl PatrolStore for FaultyStore {
    async fn insert_video(&self, video: &Video) -> Result<Video> {
        if self.reject_video_inserts {
            return Err(Error::Database("connection reset".to_string()).into());
        }
        self.inner.insert_video(video).await
    }
    async fn get_video(&self, id: &Uuid) -> Result<Option<Video>> {
        self.inner.get_video(id).await
    }
    async fn list_videos(&self, limit: Option<i64>) -> Result<Vec<Video>> {
        self.inner.list_videos(limit).await
    }
    async fn list_videos_by_status(&self, status: ProcessingStatus) -> Result<Vec<Video>> {
        self.inner.list_videos_by_status(status).await
    }
    async fn transition_video(&self, id: &Uuid, transition: &VideoTransition) -> Result<Video> {
        self.inner.transition_video(id, transition).await
    }
    async fn complete_analysis(
        &self,
        id: &Uuid,
        claimed_at: DateTime<Utc>,
        detections: &[Detection],
        alerts: &[Alert],
    ) -> Result<Video> {
        let remaining = self.failing_completions.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_completions.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Database("deadlock detected".to_string()).into());
        }
        self.inner
            .complete_analysis(id, claimed_at, detections, alerts)
            .await
    }
    async fn list_detections(&self, video_id: Option<&Uuid>) -> Result<Vec<Detection>> {
        self.inner.list_detections(video_id).await
    }
    async fn insert_alert(&self, alert: &Alert) -> Result<Alert> {
        if self.reject_alert_inserts {
            return Err(Error::Database("connection reset".to_string()).into());
        }
        self.inner.insert_alert(alert).await
    }
    async fn get_alert(&self, id: &Uuid) -> Result<Option<Alert>> {
        self.inner.get_alert(id).await
    }
    async fn list_alerts(&self, status: Option<AlertStatus>) -> Result<Vec<Alert>> {
        self.inner.list_alerts(status).await
    }
    async fn transition_alert(&self, id: &Uuid, transition: &AlertTransition) -> Result<Alert> {
        self.inner.transition_alert(id, transition).await
    }
    async fn health_check(&self) -> Result<bool> {
        self.inner.health_check().await
    }
}

fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.storage_path = dir.to_path_buf();
    config.analysis.detector_timeout_secs = 1;
    config.realtime.channel_capacity = 256;
    config
}

async fn pipeline_with(
    store: Arc<dyn PatrolStore>,
    detector: Arc<ScriptedDetector>,
    config: &Config,
) -> Result<Pipeline> {
    let blobs = Arc::new(LocalBlobStore::new(&config.storage).await?);
    Ok(Pipeline::new(store, blobs, detector, config))
}

async fn started_pipeline(detector: Arc<ScriptedDetector>) -> Result<(Pipeline, TempDir)> {
    let dir = tempfile::tempdir()?;
    let pipeline =
        pipeline_with(Arc::new(MemoryPatrolStore::new()), detector, &config(dir.path())).await?;
    pipeline.orchestrator.start().await?;
    Ok((pipeline, dir))
}

async fn wait_for_status(pipeline: &Pipeline, id: &Uuid, status: ProcessingStatus) -> Video {
    timeout(Duration::from_secs(10), async {
        loop {
            if let Some(video) = pipeline.store.get_video(id).await.unwrap() {
                if video.processing_status == status {
                    return video;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("video {} never reached {}", id, status))
}

async fn wait_for_alerts(pipeline: &Pipeline, count: usize) -> Vec<Alert> {
    timeout(Duration::from_secs(10), async {
        loop {
            let alerts = pipeline.store.list_alerts(None).await.unwrap();
            if alerts.len() >= count {
                return alerts;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {} alerts", count))
}

/// Video events seen for one record until `last` arrives
async fn video_events_until(
    subscription: &mut Subscription,
    id: Uuid,
    last: EventType,
) -> Vec<(EventType, serde_json::Value)> {
    let mut seen = Vec::new();
    timeout(Duration::from_secs(10), async {
        while let Some(delivery) = subscription.recv().await {
            if let Delivery::Change(event) = delivery {
                if event.record_id == id {
                    seen.push((event.event_type, event.payload.clone()));
                    if event.event_type == last {
                        break;
                    }
                }
            }
        }
    })
    .await
    .expect("event stream stalled");
    seen
}

fn pending_video() -> Video {
    Video::new_pending(
        Uuid::new_v4(),
        "field.mp4",
        4,
        "video/mp4",
        "file:///tmp/field.mp4".to_string(),
        VideoMetadata::default(),
    )
}

#[tokio::test]
async fn fire_video_end_to_end() -> Result<()> {
    let detector = ScriptedDetector::new(vec![Script::Detections(vec![RawDetection::new(
        "fire", 0.95,
    )])]);
    let (pipeline, dir) = started_pipeline(detector.clone()).await?;
    let mut changes = pipeline.distributor.subscribe(TableFilter::all());

    let bytes = vec![0u8; 10 * 1024 * 1024];
    let video = pipeline
        .ingestion
        .ingest(&bytes, "north field.mp4", "video/mp4", VideoMetadata::default())
        .await?;
    assert_eq!(video.file_size, 10 * 1024 * 1024);
    assert!(video.storage_url.ends_with("north_field.mp4"));
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);

    let events = video_events_until(&mut changes, video.id, EventType::VideoCompleted).await;
    let kinds: Vec<_> = events.iter().map(|(kind, _)| *kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventType::VideoIngested,
            EventType::VideoProcessingStarted,
            EventType::VideoCompleted
        ]
    );

    let completed = wait_for_status(&pipeline, &video.id, ProcessingStatus::Completed).await;
    assert!(completed.completed_at.is_some());
    assert_eq!(detector.calls(), 1);

    let detections = pipeline.store.list_detections(Some(&video.id)).await?;
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].severity_level, Severity::Critical);
    assert!(detections[0].requires_action);

    let alerts = wait_for_alerts(&pipeline, 1).await;
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.priority_level, Severity::Critical);
    assert_eq!(alert.status, AlertStatus::Active);
    assert_eq!(alert.detection_id, Some(detections[0].id));

    let acked = pipeline.alerts.acknowledge(&alert.id, "dana").await?;
    assert_eq!(acked.status, AlertStatus::Acknowledged);
    let resolved = pipeline
        .alerts
        .resolve(&alert.id, "dana", Some("Extinguished".to_string()))
        .await?;
    assert_eq!(resolved.status, AlertStatus::Resolved);
    assert!(resolved.acknowledged_at.is_some() && resolved.resolved_at.is_some());
    Ok(())
}

#[tokio::test]
async fn detector_timeout_fails_the_video() -> Result<()> {
    let (pipeline, _dir) = started_pipeline(ScriptedDetector::new(vec![Script::Hang])).await?;
    let mut changes = pipeline.distributor.subscribe(TableFilter::only([
        crate::messaging::Table::Videos,
    ]));

    let video = pipeline
        .ingestion
        .ingest(b"frames", "east.mp4", "video/mp4", VideoMetadata::default())
        .await?;

    let events = video_events_until(&mut changes, video.id, EventType::AnalysisFailed).await;
    let (_, payload) = events.last().unwrap();
    assert_eq!(payload["processing_status"], "failed");

    let failed = wait_for_status(&pipeline, &video.id, ProcessingStatus::Failed).await;
    assert!(failed.failure_reason.unwrap().contains("timed out"));
    assert!(pipeline.store.list_detections(Some(&video.id)).await?.is_empty());
    assert!(pipeline.store.list_alerts(None).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn detector_error_fails_without_alerts_and_retry_recovers() -> Result<()> {
    let detector = ScriptedDetector::new(vec![
        Script::Fail("model crashed"),
        Script::Detections(vec![RawDetection::new("pipeline-damage", 0.8)]),
    ]);
    let (pipeline, _dir) = started_pipeline(detector.clone()).await?;

    let video = pipeline
        .ingestion
        .ingest(b"frames", "line.mp4", "video/mp4", VideoMetadata::default())
        .await?;
    let failed = wait_for_status(&pipeline, &video.id, ProcessingStatus::Failed).await;
    assert!(failed.failure_reason.unwrap().contains("model crashed"));
    assert!(pipeline.store.list_alerts(None).await?.is_empty());

    let retried = pipeline.orchestrator.retry(&video.id).await?;
    assert_eq!(retried.processing_status, ProcessingStatus::Processing);
    assert!(retried.failure_reason.is_none());

    wait_for_status(&pipeline, &video.id, ProcessingStatus::Completed).await;
    let alerts = wait_for_alerts(&pipeline, 1).await;
    assert_eq!(alerts[0].alert_type, "pipeline_damage");
    assert_eq!(detector.calls(), 2);

    // Retry is only valid from failed
    let err = pipeline.orchestrator.retry(&video.id).await.unwrap_err();
    assert!(Error::is_invalid_transition(&err));
    Ok(())
}

#[tokio::test]
async fn low_confidence_person_raises_no_alert() -> Result<()> {
    let detector = ScriptedDetector::new(vec![Script::Detections(vec![
        RawDetection::new("person", 0.3),
        RawDetection::new("vehicle", f64::NAN),
    ])]);
    let (pipeline, _dir) = started_pipeline(detector).await?;

    let video = pipeline
        .ingestion
        .ingest(b"frames", "gate.mp4", "video/mp4", VideoMetadata::default())
        .await?;
    wait_for_status(&pipeline, &video.id, ProcessingStatus::Completed).await;
    sleep(Duration::from_millis(200)).await;

    let detections = pipeline.store.list_detections(Some(&video.id)).await?;
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].severity_level, Severity::Low);
    assert!(pipeline.store.list_alerts(None).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn only_one_concurrent_claim_wins() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pipeline = pipeline_with(
        Arc::new(MemoryPatrolStore::new()),
        ScriptedDetector::new(vec![Script::Hang]),
        &config(dir.path()),
    )
    .await?;
    let video = pipeline.store.insert_video(&pending_video()).await?;

    let mut claims = Vec::new();
    for _ in 0..10 {
        let orchestrator = pipeline.orchestrator.clone();
        let id = video.id;
        claims.push(tokio::spawn(async move { orchestrator.claim(&id).await }));
    }

    let mut wins = 0;
    for claim in claims {
        match claim.await? {
            Ok(_) => wins += 1,
            Err(e) => assert!(Error::is_invalid_transition(&e), "{}", e),
        }
    }
    assert_eq!(wins, 1);
    Ok(())
}

#[tokio::test]
async fn sweeper_fails_stale_processing_videos() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = config(dir.path());
    config.analysis.stale_after_secs = 0;
    let pipeline = pipeline_with(
        Arc::new(MemoryPatrolStore::new()),
        ScriptedDetector::new(vec![Script::Hang]),
        &config,
    )
    .await?;

    let stale = pipeline.store.insert_video(&pending_video()).await?;
    let untouched = pipeline.store.insert_video(&pending_video()).await?;
    let claimed = pipeline.orchestrator.claim(&stale.id).await?;
    let claimed_at = claimed.processing_started_at.unwrap();
    sleep(Duration::from_millis(5)).await;

    assert_eq!(pipeline.sweeper.sweep().await?, 1);
    let failed = pipeline.store.get_video(&stale.id).await?.unwrap();
    assert_eq!(failed.processing_status, ProcessingStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some(STALE_REASON));

    // A late detector answer can no longer complete the video
    let err = pipeline
        .store
        .complete_analysis(&stale.id, claimed_at, &[], &[])
        .await
        .unwrap_err();
    assert!(Error::is_invalid_transition(&err));

    // Nor once the video has been claimed again
    sleep(Duration::from_millis(5)).await;
    pipeline
        .store
        .transition_video(&stale.id, &VideoTransition::Retry)
        .await?;
    let err = pipeline
        .store
        .complete_analysis(&stale.id, claimed_at, &[], &[])
        .await
        .unwrap_err();
    assert!(Error::is_invalid_transition(&err));
    let reclaimed = pipeline.store.get_video(&stale.id).await?.unwrap();
    assert_eq!(reclaimed.processing_status, ProcessingStatus::Processing);

    let pending = pipeline.store.get_video(&untouched.id).await?.unwrap();
    assert_eq!(pending.processing_status, ProcessingStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn pending_videos_are_recovered_on_start() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let detector = ScriptedDetector::new(vec![Script::Detections(Vec::new())]);
    let pipeline = pipeline_with(
        Arc::new(MemoryPatrolStore::new()),
        detector.clone(),
        &config(dir.path()),
    )
    .await?;
    let left_over = pipeline.store.insert_video(&pending_video()).await?;

    let handles = pipeline.start().await?;
    wait_for_status(&pipeline, &left_over.id, ProcessingStatus::Completed).await;
    assert_eq!(detector.calls(), 1);

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

#[tokio::test]
async fn rejected_uploads_write_nothing() -> Result<()> {
    let (pipeline, dir) = started_pipeline(ScriptedDetector::new(vec![Script::Hang])).await?;

    let err = pipeline
        .ingestion
        .ingest(b"png", "photo.png", "image/png", VideoMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(Error::find(&err), Some(Error::InvalidFileType(_))));
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    assert!(pipeline.store.list_videos(None).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_record_insert_removes_the_blob() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pipeline = pipeline_with(
        Arc::new(FaultyStore {
            reject_video_inserts: true,
            ..FaultyStore::default()
        }),
        ScriptedDetector::new(vec![Script::Hang]),
        &config(dir.path()),
    )
    .await?;

    let err = pipeline
        .ingestion
        .ingest(b"frames", "west.mp4", "video/mp4", VideoMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(Error::find(&err), Some(Error::Database(_))));
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn oversize_upload_writes_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = config(dir.path());
    config.storage.max_upload_bytes = 8;
    let pipeline = pipeline_with(
        Arc::new(MemoryPatrolStore::new()),
        ScriptedDetector::new(vec![Script::Hang]),
        &config,
    )
    .await?;

    pipeline
        .ingestion
        .ingest(b"8 bytes!", "fits.mp4", "video/mp4", VideoMetadata::default())
        .await?;
    let err = pipeline
        .ingestion
        .ingest(b"9 bytes!!", "big.mp4", "video/mp4", VideoMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(
        Error::find(&err),
        Some(Error::FileTooLarge { size: 9, max: 8 })
    ));
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
    assert_eq!(pipeline.store.list_videos(None).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn queued_retry_runs_the_detector_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = config(dir.path());
    config.analysis.max_concurrent = 1;
    config.analysis.stale_after_secs = 0;
    let detector = ScriptedDetector::new(vec![
        Script::Hang,
        Script::Detections(vec![RawDetection::new("fire", 0.95)]),
    ]);
    let pipeline = pipeline_with(
        Arc::new(MemoryPatrolStore::new()),
        detector.clone(),
        &config,
    )
    .await?;
    pipeline.orchestrator.start().await?;

    let retried = pipeline.store.insert_video(&pending_video()).await?;
    let claimed = pipeline.orchestrator.claim(&retried.id).await?;
    pipeline
        .orchestrator
        .fail(&retried.id, claimed.processing_started_at.unwrap(), "model crashed")
        .await?;

    // Occupy the only worker
    let busy = pipeline
        .ingestion
        .ingest(b"frames", "busy.mp4", "video/mp4", VideoMetadata::default())
        .await?;
    wait_for_status(&pipeline, &busy.id, ProcessingStatus::Processing).await;

    let waiting = pipeline.orchestrator.retry(&retried.id).await?;
    assert_eq!(waiting.processing_status, ProcessingStatus::Failed);

    // A waiting retry is not processing, so the sweeper leaves it alone
    sleep(Duration::from_millis(5)).await;
    assert_eq!(pipeline.sweeper.sweep().await?, 1);
    let still = pipeline.store.get_video(&retried.id).await?.unwrap();
    assert_eq!(still.processing_status, ProcessingStatus::Failed);
    assert_eq!(still.failure_reason.as_deref(), Some("model crashed"));

    pipeline.orchestrator.retry(&retried.id).await?;

    wait_for_status(&pipeline, &retried.id, ProcessingStatus::Completed).await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(detector.calls_for(&retried.id), 1);
    assert_eq!(detector.calls_for(&busy.id), 1);
    assert_eq!(pipeline.store.list_detections(Some(&retried.id)).await?.len(), 1);
    assert_eq!(pipeline.store.list_alerts(None).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn derived_alerts_commit_with_the_analysis() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(FaultyStore {
        reject_alert_inserts: true,
        failing_completions: AtomicUsize::new(1),
        ..FaultyStore::default()
    });
    let detector = ScriptedDetector::new(vec![Script::Detections(vec![RawDetection::new(
        "fire", 0.95,
    )])]);
    let pipeline = pipeline_with(store, detector, &config(dir.path())).await?;
    pipeline.orchestrator.start().await?;

    let video = pipeline
        .ingestion
        .ingest(b"frames", "south.mp4", "video/mp4", VideoMetadata::default())
        .await?;

    // The failed write leaves neither detections nor alerts behind
    let failed = wait_for_status(&pipeline, &video.id, ProcessingStatus::Failed).await;
    assert!(failed.failure_reason.unwrap().contains("failed to store results"));
    assert!(pipeline.store.list_detections(Some(&video.id)).await?.is_empty());
    assert!(pipeline.store.list_alerts(None).await?.is_empty());

    // Standalone alert inserts still fail, yet the alert lands with the analysis
    pipeline.orchestrator.retry(&video.id).await?;
    wait_for_status(&pipeline, &video.id, ProcessingStatus::Completed).await;
    let detections = pipeline.store.list_detections(Some(&video.id)).await?;
    assert_eq!(detections.len(), 1);
    let alerts = pipeline.store.list_alerts(None).await?;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].priority_level, Severity::Critical);
    assert_eq!(alerts[0].detection_id, Some(detections[0].id));
    Ok(())
}

#[tokio::test]
async fn gps_metadata_is_stored_as_given() -> Result<()> {
    let (pipeline, _dir) = started_pipeline(ScriptedDetector::new(vec![Script::Hang])).await?;
    let metadata = VideoMetadata {
        gps: Some(crate::db::models::GpsCoordinates {
            latitude: 95.5,
            longitude: -200.25,
        }),
        field_sector: Some("B7".to_string()),
        weather_conditions: Some(serde_json::json!({"wind_kph": 12})),
    };

    let video = pipeline
        .ingestion
        .ingest(b"frames", "drift.mp4", "video/mp4", metadata.clone())
        .await?;
    let stored = pipeline.store.get_video(&video.id).await?.unwrap();
    assert_eq!(stored.gps, metadata.gps);
    assert_eq!(stored.weather_conditions, metadata.weather_conditions);
    Ok(())
}
