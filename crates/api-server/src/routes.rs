use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use domain::entities::{Torrent, TorrentStatus};
use domain::protocol::TorrentSource;
use domain::{DomainError, EngineHealth, EngineSupervisor, TorrentDetails};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<EngineSupervisor>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddTorrentRequest {
    /// Magnet link or `.torrent` URL.
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct RemoveParams {
    #[serde(default)]
    pub delete_files: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TorrentInfo {
    pub id: Option<i32>,
    pub info_hash: String,
    pub name: String,
    pub total_size: i64,
    pub piece_length: i32,
    pub piece_count: i32,
    pub status: TorrentStatus,
    pub progress: f32,
}

impl From<Torrent> for TorrentInfo {
    fn from(torrent: Torrent) -> Self {
        Self {
            id: torrent.id,
            info_hash: torrent.info_hash,
            name: torrent.name,
            total_size: torrent.total_size,
            piece_length: torrent.piece_length,
            piece_count: torrent.piece_count,
            status: torrent.status,
            progress: torrent.progress,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: &'static str,
    #[serde(flatten)]
    health: EngineHealth,
}

/// Maps engine errors onto HTTP status codes.
pub struct ApiError(DomainError);

impl From<DomainError> for ApiError {
    fn from(e: DomainError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DomainError::TorrentNotFound(_) | DomainError::TorrentNotFoundByHash(_) => StatusCode::NOT_FOUND,
            DomainError::MalformedMetadata(_) | DomainError::ValidationError(_) => StatusCode::BAD_REQUEST,
            DomainError::InvalidTransition { .. } => StatusCode::CONFLICT,
            DomainError::TrackerUnreachable { .. } | DomainError::NetworkError(_) => StatusCode::BAD_GATEWAY,
            DomainError::EngineShutdown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/torrents", get(list_torrents).post(add_torrent))
        .route("/api/torrents/upload", post(upload_torrent))
        .route("/api/torrents/:id", get(get_torrent).delete(remove_torrent))
        .route("/api/torrents/:id/start", post(start_torrent))
        .route("/api/torrents/:id/pause", post(pause_torrent))
        .route("/api/torrents/:id/resume", post(resume_torrent))
        .route("/api/status", get(get_status))
        .route("/health", get(health_check))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn list_torrents(State(state): State<AppState>) -> Json<Vec<TorrentInfo>> {
    let torrents = state.supervisor.list().await;
    Json(torrents.into_iter().map(Into::into).collect())
}

/// Registers the source and starts it; a known info-hash is started again.
async fn add_and_start(state: &AppState, source: TorrentSource) -> Result<Response, ApiError> {
    let torrent = state.supervisor.add(source).await?;
    let id = torrent
        .id
        .ok_or_else(|| DomainError::ValidationError("torrent was not persisted".to_string()))?;
    let torrent = state.supervisor.start(id).await?;
    info!(torrent_id = id, name = %torrent.name, "Torrent accepted");
    Ok((StatusCode::CREATED, Json(TorrentInfo::from(torrent))).into_response())
}

async fn add_torrent(
    State(state): State<AppState>,
    Json(payload): Json<AddTorrentRequest>,
) -> Result<Response, ApiError> {
    let url = payload.url.trim();
    if url.is_empty() {
        return Err(DomainError::ValidationError("url is required".to_string()).into());
    }
    add_and_start(&state, TorrentSource::from_link(url)).await
}

async fn upload_torrent(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let invalid = |e: axum::extract::multipart::MultipartError| DomainError::ValidationError(e.to_string());
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        if field.name() == Some("torrent") || field.file_name().is_some() {
            let bytes = field.bytes().await.map_err(invalid)?;
            return add_and_start(&state, TorrentSource::TorrentBytes(bytes.to_vec())).await;
        }
    }
    Err(DomainError::ValidationError("multipart field 'torrent' is required".to_string()).into())
}

async fn get_torrent(State(state): State<AppState>, Path(id): Path<i32>) -> Result<Json<TorrentDetails>, ApiError> {
    Ok(Json(state.supervisor.details(id).await?))
}

async fn remove_torrent(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Query(params): Query<RemoveParams>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.remove(id, params.delete_files).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_torrent(State(state): State<AppState>, Path(id): Path<i32>) -> Result<Json<TorrentInfo>, ApiError> {
    Ok(Json(state.supervisor.start(id).await?.into()))
}

async fn pause_torrent(State(state): State<AppState>, Path(id): Path<i32>) -> Result<Json<TorrentInfo>, ApiError> {
    Ok(Json(state.supervisor.pause(id).await?.into()))
}

async fn resume_torrent(State(state): State<AppState>, Path(id): Path<i32>) -> Result<Json<TorrentInfo>, ApiError> {
    Ok(Json(state.supervisor.resume(id).await?.into()))
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        health: state.supervisor.health().await,
    })
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.supervisor.health().await;
    Json(serde_json::json!({
        "status": "ok",
        "torrents": health.total_torrents,
        "errored": health.errored_torrents,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use domain::protocol::metainfo::build_torrent_file;
    use domain::repositories::memory::MemoryStore;
    use domain::services::tracker_client::{AnnounceRequest, AnnounceResponse, Announcer, ScrapeStats};
    use domain::EngineSettings;
    use tower::ServiceExt;

    struct Offline;

    #[async_trait]
    impl Announcer for Offline {
        async fn announce(&self, url: &str, _request: &AnnounceRequest) -> Result<AnnounceResponse, DomainError> {
            Err(DomainError::TrackerUnreachable {
                url: url.to_string(),
                reason: "offline".into(),
            })
        }

        async fn scrape(&self, _url: &str, _info_hash: &[u8; 20]) -> Result<ScrapeStats, DomainError> {
            Ok(ScrapeStats::default())
        }
    }

    struct Harness {
        app: Router,
        supervisor: Arc<EngineSupervisor>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let settings = EngineSettings {
            download_dir: dir.path().to_path_buf(),
            ..EngineSettings::default()
        };
        let supervisor = Arc::new(EngineSupervisor::new(
            MemoryStore::new().repositories(),
            settings,
            Arc::new(Offline),
        ));
        Harness {
            app: router(AppState {
                supervisor: supervisor.clone(),
            }),
            supervisor,
            _dir: dir,
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    fn upload(bytes: &[u8]) -> Request<Body> {
        let boundary = "engine-test-boundary";
        let mut body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"torrent\"; filename=\"a.torrent\"\r\n\
             Content-Type: application/x-bittorrent\r\n\r\n",
            b = boundary
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
        Request::builder()
            .method("POST")
            .uri("/api/torrents/upload")
            .header("content-type", format!("multipart/form-data; boundary={}", boundary))
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn upload_creates_and_starts_a_torrent() {
        let h = harness();
        let file = build_torrent_file("a.bin", &vec![3u8; 40_000], 16384, None);

        let (status, json) = send(&h.app, upload(&file)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["piece_count"], 3);
        assert_eq!(json["status"]["state"], "downloading");
        let id = json["id"].as_i64().unwrap();

        let (status, list) = send(&h.app, empty("GET", "/api/torrents")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, details) = send(&h.app, empty("GET", &format!("/api/torrents/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(details["piece_bitmap"], "00");
        assert_eq!(details["files"][0]["path"], "a.bin");

        let (status, paused) = send(&h.app, empty("POST", &format!("/api/torrents/{}/pause", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(paused["status"]["state"], "paused");

        let (status, _) = send(&h.app, empty("DELETE", &format!("/api/torrents/{}?delete_files=true", id))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&h.app, empty("GET", &format!("/api/torrents/{}", id))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn magnet_urls_enter_parsing() {
        let h = harness();
        let magnet = format!("magnet:?xt=urn:btih:{}&dn=pending", "5".repeat(40));
        let (status, json) = send(&h.app, json_request("POST", "/api/torrents", serde_json::json!({ "url": magnet }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["status"]["state"], "parsing");
        assert_eq!(json["name"], "pending");
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let h = harness();

        let (status, json) = send(&h.app, empty("POST", "/api/torrents/42/start")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("42"));

        let (status, _) = send(&h.app, upload(b"not bencode")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&h.app, json_request("POST", "/api/torrents", serde_json::json!({ "url": " " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Added but never started: there is nothing to resume
        let file = build_torrent_file("b.bin", &[1u8; 100], 16384, None);
        let torrent = h.supervisor.add(TorrentSource::TorrentBytes(file)).await.unwrap();
        let uri = format!("/api/torrents/{}/resume", torrent.id.unwrap());
        let (status, _) = send(&h.app, empty("POST", &uri)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn status_reports_engine_health() {
        let h = harness();
        let (status, json) = send(&h.app, empty("GET", "/api/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total_torrents"], 0);
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));

        let (status, json) = send(&h.app, empty("GET", "/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        h.supervisor.shutdown().await;
    }
}
