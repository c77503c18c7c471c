use crate::db::models::{Video, VideoMetadata};
use crate::db::repositories::PatrolStore;
use crate::error::Error;
use crate::messaging::{ChangeEvent, EventType, RealtimeDistributor};
use crate::services::analysis::AnalysisOrchestrator;
use crate::storage::{sanitize_filename, BlobStore};
use anyhow::Result;
use log::{error, info, warn};
use std::sync::Arc;
use uuid::Uuid;

/// Check an upload before anything is written.
///
/// The declared media type must be `video/<subtype>` and the size must not exceed
/// `max_bytes`.
pub fn validate_upload(
    filename: &str,
    content_type: &str,
    size: u64,
    max_bytes: u64,
) -> Result<(), Error> {
    if filename.trim().is_empty() {
        return Err(Error::Validation("Filename must not be empty".to_string()));
    }

    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.strip_prefix("video/") {
        Some(subtype) if !subtype.is_empty() => {}
        _ => return Err(Error::InvalidFileType(content_type.to_string())),
    }

    if size > max_bytes {
        return Err(Error::FileTooLarge {
            size,
            max: max_bytes,
        });
    }

    Ok(())
}

/// GPS metadata is stored as given; only values that are not numbers are refused
fn validate_metadata(metadata: &VideoMetadata) -> Result<(), Error> {
    if let Some(gps) = &metadata.gps {
        if !gps.latitude.is_finite() || !gps.longitude.is_finite() {
            return Err(Error::Validation(format!(
                "GPS position must be numeric: {}, {}",
                gps.latitude, gps.longitude
            )));
        }
    }
    Ok(())
}

/// Accepts uploads: validate, store the file, record the video, hand it to analysis
pub struct IngestionManager {
    store: Arc<dyn PatrolStore>,
    blobs: Arc<dyn BlobStore>,
    orchestrator: Arc<AnalysisOrchestrator>,
    distributor: RealtimeDistributor,
    max_upload_bytes: u64,
}

impl IngestionManager {
    pub fn new(
        store: Arc<dyn PatrolStore>,
        blobs: Arc<dyn BlobStore>,
        orchestrator: Arc<AnalysisOrchestrator>,
        distributor: RealtimeDistributor,
        max_upload_bytes: u64,
    ) -> Self {
        Self {
            store,
            blobs,
            orchestrator,
            distributor,
            max_upload_bytes,
        }
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Ingest one upload. Returns once the `pending` video record exists; analysis runs
    /// in the background.
    pub async fn ingest(
        &self,
        bytes: &[u8],
        filename: &str,
        content_type: &str,
        metadata: VideoMetadata,
    ) -> Result<Video> {
        validate_upload(filename, content_type, bytes.len() as u64, self.max_upload_bytes)?;
        validate_metadata(&metadata)?;

        let id = Uuid::new_v4();
        let storage_url = self
            .blobs
            .store(bytes, &format!("{}-{}", id, sanitize_filename(filename)))
            .await?;

        let video = Video::new_pending(
            id,
            filename,
            bytes.len() as u64,
            content_type,
            storage_url,
            metadata,
        );

        let video = match self.store.insert_video(&video).await {
            Ok(video) => video,
            Err(e) => {
                // Leave nothing behind when the record cannot be created
                if let Err(remove_err) = self.blobs.remove(&video.storage_url).await {
                    error!(
                        "Failed to remove blob {} after rejected ingestion: {}",
                        video.storage_url, remove_err
                    );
                }
                return Err(e);
            }
        };

        info!(
            "Ingested video {} ({}, {} bytes)",
            video.id, video.filename, video.file_size
        );

        match ChangeEvent::for_video(EventType::VideoIngested, &video) {
            Ok(event) => {
                self.distributor.publish(event);
            }
            Err(e) => warn!("Failed to encode ingestion event for {}: {}", video.id, e),
        }

        self.orchestrator.enqueue(video.id);

        Ok(video)
    }
}
