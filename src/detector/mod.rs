//! Client side of the external detection service.
//!
//! The detector is opaque: it receives a video id and a URL it can fetch the file from,
//! and answers with a list of `(type, confidence, timestamp?, bbox?)` tuples.

use crate::db::models::RawDetection;
use crate::error::Error;
use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[async_trait]
pub trait Detector: Send + Sync {
    async fn analyze(&self, video_id: Uuid, video_url: &str) -> Result<Vec<RawDetection>>;
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    video_id: Uuid,
    video_url: &'a str,
}

/// Detector responses come either as a bare array or wrapped in an object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnalyzeResponse {
    Wrapped { detections: Vec<RawDetection> },
    Bare(Vec<RawDetection>),
}

impl From<AnalyzeResponse> for Vec<RawDetection> {
    fn from(response: AnalyzeResponse) -> Self {
        match response {
            AnalyzeResponse::Wrapped { detections } => detections,
            AnalyzeResponse::Bare(detections) => detections,
        }
    }
}

/// Detector reached over HTTP: `POST <endpoint>` with `{video_id, video_url}`
pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDetector {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("Failed to build detector client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn analyze(&self, video_id: Uuid, video_url: &str) -> Result<Vec<RawDetection>> {
        debug!("Requesting analysis of {} from {}", video_id, self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&AnalyzeRequest {
                video_id,
                video_url,
            })
            .send()
            .await
            .map_err(|e| Error::Detector(format!("Detector request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Detector(format!("Detector returned {}: {}", status, body)).into());
        }

        let parsed: AnalyzeResponse = response
            .json()
            .await
            .map_err(|e| Error::Detector(format!("Invalid detector response: {}", e)))?;

        Ok(parsed.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_response_shapes_parse() {
        let wrapped: AnalyzeResponse =
            serde_json::from_str(r#"{"detections": [{"type": "fire", "confidence": 0.95}]}"#)
                .unwrap();
        let bare: AnalyzeResponse =
            serde_json::from_str(r#"[{"type": "vehicle", "confidence": 0.5}]"#).unwrap();

        let wrapped: Vec<RawDetection> = wrapped.into();
        let bare: Vec<RawDetection> = bare.into();
        assert_eq!(wrapped[0].detection_type, "fire");
        assert_eq!(bare[0].detection_type, "vehicle");
    }

    #[tokio::test]
    async fn unreachable_detector_is_a_detector_error() {
        let detector = HttpDetector::new("http://127.0.0.1:9/analyze").unwrap();
        let err = detector
            .analyze(Uuid::new_v4(), "file:///tmp/x.mp4")
            .await
            .unwrap_err();
        assert!(matches!(Error::find(&err), Some(Error::Detector(_))));
    }
}
