use crate::api::websocket::changes_handler;
use crate::config::ApiConfig;
use crate::db::models::{
    Alert, AlertStatus, Detection, GpsCoordinates, ManualAlert, Video, VideoMetadata,
};
use crate::error::Error;
use crate::services::Pipeline;
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

/// Header carrying the operator acting on an alert
pub const ACTOR_HEADER: &str = "x-actor";
const DEFAULT_ACTOR: &str = "operator";

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    pub status: u16,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            message: message.into(),
            status: StatusCode::BAD_REQUEST.as_u16(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match err {
            Error::InvalidFileType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        ApiError {
            message: err.to_string(),
            status: status.as_u16(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(err) = err.downcast_ref::<Error>() {
            return err.clone().into();
        }

        ApiError {
            message: err.to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
        }
    }
}

/// Implement IntoResponse for ApiError
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(self);
        (status, body).into_response()
    }
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    // Leave room for the multipart framing around a maximum-size file
    let body_limit = state.pipeline.ingestion.max_upload_bytes() as usize + 1024 * 1024;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(false)
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health))
        // Video routes
        .route("/api/videos", get(list_videos).post(upload_video))
        .route("/api/videos/:id", get(get_video))
        .route("/api/videos/:id/retry", post(retry_video))
        // Detection routes
        .route("/api/detections", get(list_detections))
        // Alert routes
        .route("/api/alerts", get(list_alerts).post(create_alert))
        .route("/api/alerts/:id", get(get_alert))
        .route("/api/alerts/:id/acknowledge", post(acknowledge_alert))
        .route("/api/alerts/:id/resolve", post(resolve_alert))
        // Change feed
        .route("/api/changes", get(changes_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
}

pub struct RestApi {
    config: ApiConfig,
    pipeline: Arc<Pipeline>,
}

impl RestApi {
    pub fn new(config: &ApiConfig, pipeline: Arc<Pipeline>) -> Self {
        Self {
            config: config.clone(),
            pipeline,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let app = router(AppState {
            pipeline: self.pipeline.clone(),
        });

        let addr = self.config.address.clone() + ":" + &self.config.port.to_string();
        let addr: SocketAddr = addr.parse()?;

        info!("API server listening on {}", addr);

        let listener = TcpListener::bind(addr).await?;

        axum::Server::from_tcp(listener.into_std()?)?
            .serve(app.into_make_service())
            .await?;

        Ok(())
    }
}

/// The acting operator, from the `X-Actor` header
fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_ACTOR)
        .to_string()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    store: bool,
    subscribers: usize,
}

async fn health(State(state): State<AppState>) -> Response {
    let store = state.pipeline.store.health_check().await.unwrap_or(false);
    let body = HealthResponse {
        status: if store { "ok" } else { "degraded" },
        store,
        subscribers: state.pipeline.distributor.subscriber_count(),
    };
    let status = if store {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// File part plus the optional metadata parts of an upload
#[derive(Debug, Default)]
struct UploadForm {
    file: Option<(String, String, Bytes)>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    field_sector: Option<String>,
    weather_conditions: Option<serde_json::Value>,
}

impl UploadForm {
    /// The file part, handed on without copying, and the upload metadata
    fn into_upload(
        self,
    ) -> std::result::Result<(String, String, Bytes, VideoMetadata), ApiError> {
        let metadata = self.metadata()?;
        let (filename, content_type, bytes) = self
            .file
            .ok_or_else(|| ApiError::bad_request("Missing file part"))?;
        Ok((filename, content_type, bytes, metadata))
    }

    fn metadata(&self) -> std::result::Result<VideoMetadata, ApiError> {
        let gps = match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GpsCoordinates {
                latitude,
                longitude,
            }),
            (None, None) => None,
            _ => {
                return Err(ApiError::bad_request(
                    "latitude and longitude must be given together",
                ))
            }
        };

        Ok(VideoMetadata {
            gps,
            field_sector: self.field_sector.clone().filter(|s| !s.trim().is_empty()),
            weather_conditions: self.weather_conditions.clone(),
        })
    }
}

fn parse_coordinate(name: &str, value: &str) -> std::result::Result<f64, ApiError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| ApiError::bad_request(format!("{} must be a number", name)))
}

async fn upload_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<Video>)> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| ApiError {
        message: e.body_text(),
        status: e.status().as_u16(),
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(|e| ApiError {
                    message: e.body_text(),
                    status: e.status().as_u16(),
                })?;
                form.file = Some((filename, content_type, bytes));
            }
            "latitude" | "longitude" | "field_sector" | "weather_conditions" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                match name.as_str() {
                    "latitude" => form.latitude = Some(parse_coordinate(&name, &text)?),
                    "longitude" => form.longitude = Some(parse_coordinate(&name, &text)?),
                    "field_sector" => form.field_sector = Some(text),
                    _ => {
                        let value = serde_json::from_str(&text).map_err(|e| {
                            ApiError::bad_request(format!("weather_conditions must be JSON: {}", e))
                        })?;
                        form.weather_conditions = Some(value);
                    }
                }
            }
            other => debug!("Ignoring upload field {}", other),
        }
    }

    let (filename, content_type, bytes, metadata) = form.into_upload()?;

    let video = state
        .pipeline
        .ingestion
        .ingest(&bytes, &filename, &content_type, metadata)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(video)))
}

#[derive(Debug, Deserialize)]
struct ListVideosQuery {
    limit: Option<i64>,
}

async fn list_videos(
    State(state): State<AppState>,
    Query(query): Query<ListVideosQuery>,
) -> ApiResult<Json<Vec<Video>>> {
    let videos = state.pipeline.store.list_videos(query.limit).await?;
    Ok(Json(videos))
}

async fn get_video(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Video>> {
    let video = state
        .pipeline
        .store
        .get_video(&id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Video not found: {}", id)))?;

    Ok(Json(video))
}

async fn retry_video(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Video>)> {
    let video = state.pipeline.orchestrator.retry(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(video)))
}

#[derive(Debug, Deserialize)]
struct ListDetectionsQuery {
    video_id: Option<Uuid>,
}

async fn list_detections(
    State(state): State<AppState>,
    Query(query): Query<ListDetectionsQuery>,
) -> ApiResult<Json<Vec<Detection>>> {
    let detections = state
        .pipeline
        .store
        .list_detections(query.video_id.as_ref())
        .await?;
    Ok(Json(detections))
}

#[derive(Debug, Deserialize)]
struct ListAlertsQuery {
    status: Option<String>,
}

/// Alert status filter: active by default, `all` for every alert
fn status_filter(status: Option<&str>) -> std::result::Result<Option<AlertStatus>, Error> {
    match status.map(str::trim) {
        None | Some("") => Ok(Some(AlertStatus::Active)),
        Some("all") => Ok(None),
        Some(other) => other
            .parse()
            .map(Some)
            .map_err(|_| Error::Validation(format!("Unknown alert status: {}", other))),
    }
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<ListAlertsQuery>,
) -> ApiResult<Json<Vec<Alert>>> {
    let filter = status_filter(query.status.as_deref())?;
    let alerts = state.pipeline.store.list_alerts(filter).await?;
    Ok(Json(alerts))
}

async fn get_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Alert>> {
    let alert = state
        .pipeline
        .store
        .get_alert(&id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Alert not found: {}", id)))?;

    Ok(Json(alert))
}

async fn create_alert(
    State(state): State<AppState>,
    Json(manual): Json<ManualAlert>,
) -> ApiResult<(StatusCode, Json<Alert>)> {
    let alert = state.pipeline.alerts.raise(manual.into()).await?;
    Ok((StatusCode::CREATED, Json(alert)))
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<Alert>> {
    let alert = state
        .pipeline
        .alerts
        .acknowledge(&id, &actor(&headers))
        .await?;
    Ok(Json(alert))
}

#[derive(Debug, Default, Deserialize)]
struct ResolveRequest {
    notes: Option<String>,
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Option<Json<ResolveRequest>>,
) -> ApiResult<Json<Alert>> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let alert = state
        .pipeline
        .alerts
        .resolve(&id, &actor(&headers), request.notes)
        .await?;
    Ok(Json(alert))
}
