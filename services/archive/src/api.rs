use crate::access_gate::{AccessGate, AccessLevel, Caller};
use crate::archive_index::derive_service;
use crate::archive_job::ArchiveJob;
use crate::config::ApiConfig;
use crate::error::{ArchiveError, DenyReason};
use crate::filter_pipeline::SearchCriteria;
use crate::log_store::ArchiveJobRecord;
use crate::object_store::ObjectStore;
use crate::path_scheme::PathScheme;
use crate::retention::{RetentionSweeper, SweepOutcome, SweepReport};
use crate::scheduler::{CronScheduler, ScheduledJobInfo};
use crate::search::{SearchResponse, SearchService};
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Header carrying the caller's API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub search: Arc<SearchService>,
    pub gate: Arc<AccessGate>,
    pub store: Arc<dyn ObjectStore>,
    pub scheme: Arc<PathScheme>,
    pub archive_job: Arc<ArchiveJob>,
    pub retention: Arc<RetentionSweeper>,
    pub scheduler: Arc<CronScheduler>,
    /// Checked by `/ready` when present
    pub db_pool: Option<PgPool>,
    pub presigned_url_expiry: Duration,
}

/// Search request body: criteria plus an optional deadline
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    #[serde(flatten)]
    pub criteria: SearchCriteria,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadUrlQuery {
    pub key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadUrlResponse {
    pub success: bool,
    pub key: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRunRequest {
    /// Hour to archive, defaults to the previous complete hour
    pub hour_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRunResponse {
    pub success: bool,
    pub job: ArchiveJobRecord,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionRunResponse {
    pub success: bool,
    pub report: SweepReport,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulesResponse {
    pub success: bool,
    pub jobs: Vec<ScheduledJobInfo>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_body(status: StatusCode, error: String, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error,
            code: code.to_string(),
        }),
    )
}

/// Map an engine error onto an HTTP response
fn error_response(e: ArchiveError) -> ApiError {
    let status = match &e {
        ArchiveError::AccessDenied { reason } => match reason {
            DenyReason::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            DenyReason::UnknownCaller => StatusCode::UNAUTHORIZED,
            _ => StatusCode::FORBIDDEN,
        },
        ArchiveError::InvalidCriteria(_)
        | ArchiveError::MalformedPath { .. }
        | ArchiveError::InvalidComponent { .. } => StatusCode::BAD_REQUEST,
        ArchiveError::ObjectNotFound(_) | ArchiveError::UnknownJob(_) => StatusCode::NOT_FOUND,
        ArchiveError::StorageUnavailable(_) | ArchiveError::Database(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ArchiveError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ArchiveError::Config(_) | ArchiveError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    if status.is_server_error() {
        error!(error = %e, "Request failed");
    }
    error_body(status, e.to_string(), e.code())
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> std::result::Result<Caller, ApiError> {
    let api_key = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    state.gate.resolve(api_key).map_err(error_response)
}

fn authenticate_with(
    state: &AppState,
    headers: &HeaderMap,
    level: AccessLevel,
) -> std::result::Result<Caller, ApiError> {
    let caller = authenticate(state, headers)?;
    AccessGate::require(&caller.profile, level).map_err(error_response)?;
    Ok(caller)
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/files/search", post(search_files))
        .route("/api/v1/files/url", get(download_url))
        .route("/api/v1/archive/run", post(run_archive))
        .route("/api/v1/retention/run", post(run_retention))
        .route("/api/v1/schedules", get(list_schedules))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "archive-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(pool) = &state.db_pool {
        if let Err(e) = sqlx::query("SELECT 1").fetch_one(pool).await {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "not_ready",
                    "database": "disconnected",
                    "error": e.to_string()
                })),
            );
        }
    }

    let database = if state.db_pool.is_some() {
        "connected"
    } else {
        "not_configured"
    };

    match state.store.list_objects(None, None).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": database,
                "storage": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "storage": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Search archived files
#[instrument(skip(state, headers, request))]
async fn search_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SearchRequest>,
) -> std::result::Result<Json<SearchResponse>, ApiError> {
    let caller = authenticate(&state, &headers)?;
    let deadline = request.timeout_ms.map(Duration::from_millis);

    let response = state
        .search
        .search(&caller, request.criteria, deadline)
        .await
        .map_err(error_response)?;

    Ok(Json(response))
}

/// Generate a time-limited download URL for one archived file
#[instrument(skip(state, headers))]
async fn download_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<DownloadUrlQuery>,
) -> std::result::Result<Json<DownloadUrlResponse>, ApiError> {
    let caller = authenticate_with(&state, &headers, AccessLevel::Read)?;

    let date = state.scheme.parse_path(&params.key).ok().and_then(|p| p.date());
    let file_name = params.key.rsplit('/').next().unwrap_or_default();
    let service = derive_service(file_name);
    state
        .gate
        .authorize_download(
            &caller.name,
            &caller.profile,
            date,
            service.as_deref(),
            Utc::now(),
        )
        .map_err(error_response)?;

    let url = state
        .store
        .presigned_url(&params.key, state.presigned_url_expiry)
        .await
        .map_err(error_response)?
        .ok_or_else(|| {
            error_body(
                StatusCode::NOT_IMPLEMENTED,
                "storage backend cannot issue download URLs".to_string(),
                "PRESIGN_UNSUPPORTED",
            )
        })?;

    let expires_at = Utc::now()
        + chrono::Duration::from_std(state.presigned_url_expiry).unwrap_or(chrono::Duration::zero());

    info!(caller = %caller.name, key = %params.key, "Issued download URL");

    Ok(Json(DownloadUrlResponse {
        success: true,
        key: params.key,
        url,
        expires_at,
    }))
}

/// Archive one hour of logs on demand
#[instrument(skip(state, headers, request))]
async fn run_archive(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Option<Json<ArchiveRunRequest>>,
) -> std::result::Result<Json<ArchiveRunResponse>, ApiError> {
    let caller = authenticate_with(&state, &headers, AccessLevel::Write)?;
    let hour_start = request
        .and_then(|Json(r)| r.hour_start)
        .unwrap_or_else(|| ArchiveJob::previous_hour(Utc::now()));

    info!(caller = %caller.name, %hour_start, "Archive run requested");
    let job = state
        .archive_job
        .run_hour(hour_start)
        .await
        .map_err(error_response)?;

    Ok(Json(ArchiveRunResponse { success: true, job }))
}

/// Trigger a retention sweep
#[instrument(skip(state, headers))]
async fn run_retention(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<RetentionRunResponse>, ApiError> {
    let caller = authenticate_with(&state, &headers, AccessLevel::Admin)?;
    info!(caller = %caller.name, "Retention sweep requested");

    match state.retention.run_once(Utc::now()).await {
        SweepOutcome::Completed(report) => Ok(Json(RetentionRunResponse {
            success: true,
            report,
        })),
        SweepOutcome::Skipped => Err(error_body(
            StatusCode::CONFLICT,
            "a retention sweep is already running or the sweeper is stopped".to_string(),
            "SWEEP_SKIPPED",
        )),
    }
}

/// List scheduled jobs
async fn list_schedules(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<SchedulesResponse>, ApiError> {
    authenticate_with(&state, &headers, AccessLevel::Admin)?;
    Ok(Json(SchedulesResponse {
        success: true,
        jobs: state.scheduler.list_active(),
    }))
}

/// Serve the API until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting archive API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_gate::AccessProfile;
    use crate::archive_index::ArchiveIndex;
    use crate::config::{AccessConfig, ArchiveConfig, CallerConfig, RetentionConfig};
    use crate::filter_pipeline::FilterPipeline;
    use crate::log_store::MockLogStore;
    use crate::object_store::MemoryObjectStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn profile(level: AccessLevel, rate: u32) -> AccessProfile {
        AccessProfile {
            access_level: level,
            day_limit: 30,
            allowed_services: Default::default(),
            rate_limit_per_hour: rate,
        }
    }

    fn router(store: Arc<MemoryObjectStore>) -> Router {
        let scheme = Arc::new(PathScheme::new(ArchiveConfig::default()).unwrap());
        let gate = Arc::new(AccessGate::new(&AccessConfig {
            max_limit: 100,
            callers: vec![
                CallerConfig {
                    name: "reader".to_string(),
                    api_key: "read-key".to_string(),
                    profile: profile(AccessLevel::Read, 2),
                },
                CallerConfig {
                    name: "ops".to_string(),
                    api_key: "admin-key".to_string(),
                    profile: profile(AccessLevel::Admin, 0),
                },
            ],
        }));
        let index = ArchiveIndex::new(store.clone(), scheme.clone());
        let log_store = Arc::new(MockLogStore::new());

        let state = AppState {
            search: Arc::new(SearchService::new(
                gate.clone(),
                index.clone(),
                FilterPipeline::new(store.clone(), 4),
                None,
            )),
            gate,
            store: store.clone(),
            scheme: scheme.clone(),
            archive_job: Arc::new(ArchiveJob::new(log_store.clone(), store.clone(), scheme)),
            retention: Arc::new(RetentionSweeper::new(
                log_store,
                store,
                index,
                RetentionConfig {
                    db_retention_days: 0,
                    file_retention_days: 0,
                    ..Default::default()
                },
            )),
            scheduler: Arc::new(CronScheduler::new()),
            db_pool: None,
            presigned_url_expiry: Duration::from_secs(3600),
        };
        create_router(state, &ApiConfig::default())
    }

    fn seeded_store() -> Arc<MemoryObjectStore> {
        let store = Arc::new(MemoryObjectStore::new());
        let today = Utc::now().date_naive();
        store.insert(&format!("{}/api-logs.json", today), "[]", Utc::now());
        store.insert(&format!("{}/billing-logs.json", today), "[1]", Utc::now());
        store
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    fn search_request(key: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/files/search")
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(router(seeded_store()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_ready_reports_storage_outage() {
        let store = seeded_store();
        store.set_listing_unavailable(true);
        let request = Request::get("/ready").body(Body::empty()).unwrap();
        let (status, body) = send(router(store), request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["storage"], "disconnected");
    }

    #[tokio::test]
    async fn test_search_response_shape() {
        let (status, body) = send(
            router(seeded_store()),
            search_request(Some("read-key"), r#"{"sortBy": "size", "sortOrder": "asc", "limit": 1}"#),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["totalCount"], 2);
        assert_eq!(body["files"][0]["fileName"], "api-logs.json");
        assert_eq!(body["files"][0]["sizeBytes"], 2);
        assert_eq!(body["pagination"]["totalPages"], 2);
        assert_eq!(body["pagination"]["hasMore"], true);
        assert_eq!(body["searchCriteria"]["sortBy"], "size");
        assert_eq!(body["searchCriteria"]["appliedFilters"][0], "dateRange");
    }

    #[tokio::test]
    async fn test_search_requires_known_caller() {
        let (status, body) = send(router(seeded_store()), search_request(None, "{}")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_search_errors_map_to_status() {
        let router = router(seeded_store());

        let (status, body) = send(
            router.clone(),
            search_request(Some("read-key"), r#"{"dateRange": {"from": "2001-01-01"}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "RETENTION_WINDOW_EXCEEDED");

        for _ in 0..2 {
            let (status, _) = send(router.clone(), search_request(Some("read-key"), "{}")).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = send(router, search_request(Some("read-key"), "{}")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["code"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn test_admin_routes_check_access_level() {
        let router = router(seeded_store());

        let request = Request::post("/api/v1/retention/run")
            .header(API_KEY_HEADER, "read-key")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router.clone(), request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "INSUFFICIENT_ACCESS_LEVEL");

        let request = Request::post("/api/v1/retention/run")
            .header(API_KEY_HEADER, "admin-key")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router.clone(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["report"]["objectsDeleted"], 0);

        let request = Request::get("/api/v1/schedules")
            .header(API_KEY_HEADER, "admin-key")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs"].as_array().map(|j| j.len()), Some(0));
    }

    #[tokio::test]
    async fn test_download_url_checks_window_before_presigning() {
        let router = router(seeded_store());

        let request = Request::get("/api/v1/files/url?key=2001-01-01/api-logs.json")
            .header(API_KEY_HEADER, "read-key")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(router.clone(), request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // The memory backend has no URL signing
        let key = format!("{}/api-logs.json", Utc::now().date_naive());
        let request = Request::get(format!("/api/v1/files/url?key={}", key))
            .header(API_KEY_HEADER, "read-key")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router, request).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body["code"], "PRESIGN_UNSUPPORTED");
    }

    #[tokio::test]
    async fn test_download_url_counts_against_rate_limit() {
        let router = router(seeded_store());
        let key = format!("{}/api-logs.json", Utc::now().date_naive());
        let download = || {
            Request::get(format!("/api/v1/files/url?key={}", key))
                .header(API_KEY_HEADER, "read-key")
                .body(Body::empty())
                .unwrap()
        };

        let (status, _) = send(router.clone(), download()).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        let (status, _) = send(router.clone(), search_request(Some("read-key"), "{}")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(router, download()).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["code"], "RATE_LIMITED");
    }
}
