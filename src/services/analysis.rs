use crate::config::AnalysisConfig;
use crate::db::models::{ProcessingStatus, Video, VideoTransition};
use crate::db::repositories::PatrolStore;
use crate::detector::Detector;
use crate::error::Error;
use crate::messaging::{ChangeEvent, EventType, RealtimeDistributor};
use crate::services::alert_deriver;
use crate::services::alert_lifecycle::AlertLifecycleManager;
use crate::utils::KeyedLocks;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Drives each video through `pending -> processing -> completed | failed`.
///
/// Work arrives on a bounded queue and is analysed by one task per video; a semaphore
/// caps how many detector calls run at once. A claim (`pending -> processing`, or
/// `failed -> processing` on retry) is only taken while holding a permit, and it is the
/// only thing that authorizes a detector call. The claim's start time travels with the
/// work and the store refuses to complete or fail the video for any other claim.
pub struct AnalysisOrchestrator {
    store: Arc<dyn PatrolStore>,
    detector: Arc<dyn Detector>,
    alerts: Arc<AlertLifecycleManager>,
    distributor: RealtimeDistributor,
    locks: KeyedLocks,
    permits: Arc<Semaphore>,
    queue: mpsc::Sender<Uuid>,
    receiver: Mutex<Option<mpsc::Receiver<Uuid>>>,
    detector_timeout: Duration,
}

impl AnalysisOrchestrator {
    pub fn new(
        store: Arc<dyn PatrolStore>,
        detector: Arc<dyn Detector>,
        alerts: Arc<AlertLifecycleManager>,
        distributor: RealtimeDistributor,
        config: &AnalysisConfig,
    ) -> Self {
        let (queue, receiver) = mpsc::channel(config.queue_capacity.max(1));

        Self {
            store,
            detector,
            alerts,
            distributor,
            locks: KeyedLocks::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            queue,
            receiver: Mutex::new(Some(receiver)),
            detector_timeout: Duration::from_secs(config.detector_timeout_secs.max(1)),
        }
    }

    /// Start the dispatch loop. Calling this twice is an error.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Service("Analysis orchestrator already started".to_string()))?;

        info!(
            "Starting analysis orchestrator ({} concurrent analyses)",
            self.permits.available_permits()
        );

        let this = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(video_id) = receiver.recv().await {
                let permit = match this.permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let worker = this.clone();
                tokio::spawn(async move {
                    worker.process(video_id).await;
                    drop(permit);
                });
            }
            info!("Analysis queue closed");
        }))
    }

    /// Hand a pending video to the workers without waiting for queue space
    pub fn enqueue(&self, video_id: Uuid) {
        match self.queue.try_send(video_id) {
            Ok(()) => debug!("Queued video {} for analysis", video_id),
            Err(mpsc::error::TrySendError::Full(video_id)) => {
                warn!("Analysis queue full; video {} waits for space", video_id);
                let queue = self.queue.clone();
                tokio::spawn(async move {
                    if queue.send(video_id).await.is_err() {
                        error!("Analysis queue closed before video {} was queued", video_id);
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(video_id)) => {
                error!("Analysis queue closed; video {} stays pending", video_id);
            }
        }
    }

    /// Re-enqueue videos a previous process left `pending`
    pub async fn recover_pending(&self) -> Result<usize> {
        let pending = self
            .store
            .list_videos_by_status(ProcessingStatus::Pending)
            .await?;

        for video in &pending {
            self.enqueue(video.id);
        }
        if !pending.is_empty() {
            info!("Re-queued {} pending videos", pending.len());
        }
        Ok(pending.len())
    }

    /// Move a failed video back to `processing` and analyse it again.
    ///
    /// The video is only reclaimed once a worker is free, so it never sits in
    /// `processing` waiting for a permit. When every worker is busy the failed video is
    /// returned as it is and the retry completes in the background.
    pub async fn retry(self: &Arc<Self>, video_id: &Uuid) -> Result<Video> {
        let video = self
            .store
            .get_video(video_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Video not found: {}", video_id)))?;
        if video.processing_status != ProcessingStatus::Failed {
            return Err(VideoTransition::Retry
                .rejection(video_id, video.processing_status)
                .into());
        }

        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                let claimed = self
                    .transition(video_id, VideoTransition::Retry, EventType::VideoProcessingStarted)
                    .await?;
                info!("Retrying analysis of video {}", claimed.id);

                let this = self.clone();
                let work = claimed.clone();
                tokio::spawn(async move {
                    this.analyze(work).await;
                    drop(permit);
                });
                Ok(claimed)
            }
            Err(_) => {
                info!("Retry of video {} waits for a free worker", video.id);

                let this = self.clone();
                let video_id = video.id;
                tokio::spawn(async move {
                    let permit = match this.permits.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    this.run_retry(video_id).await;
                    drop(permit);
                });
                Ok(video)
            }
        }
    }

    /// Force a `processing` video to `failed`, provided it is still held by the claim that
    /// started at `claimed_at`
    pub async fn fail(
        &self,
        video_id: &Uuid,
        claimed_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<Video> {
        let video = self
            .transition(
                video_id,
                VideoTransition::Fail {
                    reason: reason.to_string(),
                    claimed_at,
                },
                EventType::AnalysisFailed,
            )
            .await?;
        warn!("Analysis of video {} failed: {}", video.id, reason);
        Ok(video)
    }

    /// Claim a pending video. Only the caller that wins the claim may call the detector.
    pub async fn claim(&self, video_id: &Uuid) -> Result<Video> {
        self.transition(video_id, VideoTransition::Claim, EventType::VideoProcessingStarted)
            .await
    }

    async fn process(&self, video_id: Uuid) {
        let video = match self.claim(&video_id).await {
            Ok(video) => video,
            Err(e) if Error::is_invalid_transition(&e) => {
                debug!("Video {} already claimed: {}", video_id, e);
                return;
            }
            Err(e) => {
                error!("Failed to claim video {}: {}", video_id, e);
                return;
            }
        };

        self.analyze(video).await;
    }

    async fn run_retry(&self, video_id: Uuid) {
        let video = match self
            .transition(&video_id, VideoTransition::Retry, EventType::VideoProcessingStarted)
            .await
        {
            Ok(video) => video,
            Err(e) if Error::is_invalid_transition(&e) => {
                debug!("Video {} was retried elsewhere: {}", video_id, e);
                return;
            }
            Err(e) => {
                error!("Failed to retry video {}: {}", video_id, e);
                return;
            }
        };

        info!("Retrying analysis of video {}", video.id);
        self.analyze(video).await;
    }

    /// Run the detector for a claimed video and record the outcome
    async fn analyze(&self, video: Video) {
        let Some(claimed_at) = video.processing_started_at else {
            error!("Video {} is processing without a claim time", video.id);
            return;
        };
        info!("Analysing video {} ({})", video.id, video.filename);

        let outcome = tokio::time::timeout(
            self.detector_timeout,
            self.detector.analyze(video.id, &video.storage_url),
        )
        .await;

        let raw = match outcome {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                self.record_failure(&video.id, claimed_at, &e.to_string())
                    .await;
                return;
            }
            Err(_) => {
                let reason = format!(
                    "detector timed out after {}s",
                    self.detector_timeout.as_secs()
                );
                self.record_failure(&video.id, claimed_at, &reason).await;
                return;
            }
        };

        let detections: Vec<_> = raw
            .iter()
            .filter_map(|r| alert_deriver::build_detection(video.id, r))
            .collect();
        if detections.len() < raw.len() {
            warn!(
                "Dropped {} detector results with unusable confidence for video {}",
                raw.len() - detections.len(),
                video.id
            );
        }
        let alerts: Vec<_> = detections
            .iter()
            .filter_map(|d| alert_deriver::derive(d, &video))
            .collect();

        // Detections, alerts and the status change commit together or not at all
        let alert_guards = self.alerts.lock_new(&alerts).await;
        let guard = self.locks.lock(video.id).await;
        let completed = match self
            .store
            .complete_analysis(&video.id, claimed_at, &detections, &alerts)
            .await
        {
            Ok(completed) => completed,
            Err(e) if Error::is_invalid_transition(&e) => {
                // The sweeper gave up on this claim while the detector was running
                warn!("Discarding late analysis result for video {}: {}", video.id, e);
                return;
            }
            Err(e) => {
                error!("Failed to store analysis of video {}: {}", video.id, e);
                drop(guard);
                drop(alert_guards);
                self.record_failure(
                    &video.id,
                    claimed_at,
                    &format!("failed to store results: {}", e),
                )
                .await;
                return;
            }
        };

        for detection in &detections {
            match ChangeEvent::for_detection(detection) {
                Ok(event) => {
                    self.distributor.publish(event);
                }
                Err(e) => warn!("Failed to encode detection {}: {}", detection.id, e),
            }
        }
        self.publish(EventType::VideoCompleted, &completed);
        drop(guard);

        for alert in &alerts {
            self.alerts.announce_raised(alert);
        }
        drop(alert_guards);

        info!(
            "Video {} analysed: {} detections, {} alerts",
            completed.id,
            detections.len(),
            alerts.len()
        );
    }

    async fn record_failure(&self, video_id: &Uuid, claimed_at: DateTime<Utc>, reason: &str) {
        match self.fail(video_id, claimed_at, reason).await {
            Ok(_) => {}
            Err(e) if Error::is_invalid_transition(&e) => {
                debug!("Video {} no longer held by this analysis: {}", video_id, e)
            }
            Err(e) => error!("Failed to mark video {} as failed: {}", video_id, e),
        }
    }

    async fn transition(
        &self,
        video_id: &Uuid,
        transition: VideoTransition,
        event_type: EventType,
    ) -> Result<Video> {
        let _guard = self.locks.lock(*video_id).await;

        let video = self.store.transition_video(video_id, &transition).await?;
        self.publish(event_type, &video);

        Ok(video)
    }

    fn publish(&self, event_type: EventType, video: &Video) {
        match ChangeEvent::for_video(event_type, video) {
            Ok(event) => {
                self.distributor.publish(event);
            }
            Err(e) => warn!("Failed to encode {} for video {}: {}", event_type, video.id, e),
        }
    }
}
