mod config;
mod dispatch;
mod http;
mod idempotency;
mod jobs;
mod metrics;
mod models;
mod portal;
mod retry;
mod security;
mod service;
mod session;
mod store;
mod worker;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::{DelistConfig, env_parse};
use eyre::WrapErr;
use jobs::BatchRequest;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, CompliancePageQuery, ItemsResponse, MarkStatusRequest, MarkStatusResponse,
    OfflineRequest, OfflineResponse, ProductQueryRequest, StatusQueryRequest,
    StatusQueryResponse, TotalResponse,
};
use security::{AuthContext, AuthState, require_api_auth};
use serde::Serialize;
use serde_json::json;
use service::{DelistError, DelistService};
use session::BootstrapError;
use idempotency::MemoryReplay;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "delist.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let redis = match std::env::var("REDIS_URL") {
        Ok(url) => Some(redis::Client::open(url).wrap_err("invalid REDIS_URL")?),
        Err(_) => None,
    };
    let service = DelistService::from_env(redis.clone());
    let (queue, _worker) = jobs::JobQueue::spawn(service.clone());
    let openapi: serde_json::Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install prometheus recorder")?;

    let state = AppState {
        service,
        queue,
        openapi: Arc::new(openapi),
        idempotency: Arc::new(MemoryReplay::new(idempotency::ttl_from_env())),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/offline", post(offline_products))
        .nest(
            "/jobs",
            Router::new()
                .route("/offline", post(enqueue_offline_job))
                .route("/{id}", get(get_job_status)),
        )
        .nest(
            "/compliance",
            Router::new()
                .route("/list", get(compliance_list))
                .route("/total", get(compliance_total))
                .route("/status", post(mark_product_status))
                .route("/status/query", post(query_product_statuses)),
        )
        .route("/products", post(query_products))
        .route_layer(middleware::from_fn_with_state(
            AuthState::from_env(),
            require_api_auth,
        ));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = env_parse("PORT").unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "delist.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    service: DelistService,
    queue: jobs::JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<MemoryReplay<OfflineResponse>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "delist-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY")
        && presented(&headers, "X-Docs-Key") != Some(key.as_str())
    {
        return Err(AppError::Unauthorized);
    }
    Ok(Json((*state.openapi).clone()))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY")
        && presented(&headers, "X-Metrics-Key") != Some(secret.as_str())
    {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

fn presented<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn body_limit_from_env() -> usize {
    env_parse::<usize>("REQUEST_MAX_BYTES")
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

/// Delist a batch of products and wait for every outcome.
///
/// - Method: `POST`
/// - Path: `/offline`
/// - Auth: `Authorization: Bearer <key>` or `X-Delist-Key: <key>`
/// - Body: `OfflineRequest`
/// - Response: `OfflineResponse`; replayed when `Idempotency-Key` repeats
async fn offline_products(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: HeaderMap,
    Json(payload): Json<OfflineRequest>,
) -> Result<Json<OfflineResponse>, AppError> {
    crate::metrics::inc_requests("/offline");
    let request = batch_request(payload, state.service.config())?;
    info!(
        target = "delist.api",
        account_id = %context.account_id,
        api_key = %context.api_key_id,
        products = request.product_ids.len(),
        threads = request.max_threads,
        "offline batch invoked",
    );

    let Some(key) = presented(&headers, "Idempotency-Key")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| idempotency::scoped_key(&context.account_id, s))
    else {
        return Ok(Json(execute(&state, &context, &request).await?));
    };

    if let Some(client) = &state.redis {
        if let Some(existing) = idempotency::redis_get(client, &key).await {
            return Ok(Json(existing));
        }
        let response = execute(&state, &context, &request).await?;
        let ttl = idempotency::ttl_from_env().as_secs();
        idempotency::redis_set(client, &key, &response, ttl).await;
        return Ok(Json(response));
    }
    let response = state
        .idempotency
        .get_or_run(key, || execute(&state, &context, &request))
        .await?;
    Ok(Json(response))
}

async fn execute(
    state: &AppState,
    context: &AuthContext,
    request: &BatchRequest,
) -> Result<OfflineResponse, AppError> {
    let (summary, marked) = jobs::run_batch(&state.service, &context.account_id, request).await?;
    Ok(OfflineResponse { summary, marked })
}

/// Applies the default thread count and rejects counts above the cap.
fn batch_request(payload: OfflineRequest, config: &DelistConfig) -> Result<BatchRequest, AppError> {
    let max_threads = payload.max_threads.unwrap_or(config.default_max_threads);
    if max_threads > config.max_threads_cap {
        return Err(AppError::InvalidInput(format!(
            "maxThreads must not exceed {}",
            config.max_threads_cap
        )));
    }
    Ok(BatchRequest {
        product_ids: payload.product_ids,
        max_threads,
        mark_status: payload.mark_status,
    })
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_offline_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<OfflineRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/offline");
    let request = batch_request(payload, state.service.config())?;
    let id = state
        .queue
        .enqueue(request, context)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

/// Jobs are only visible to the account that queued them; anyone else gets 404.
async fn get_job_status(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::InvalidInput("invalid_job_id".into()));
    };
    state
        .queue
        .get(uuid, &context.account_id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound("job".into()))
}

async fn mark_product_status(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<MarkStatusRequest>,
) -> Json<MarkStatusResponse> {
    crate::metrics::inc_requests("/compliance/status");
    let updated = state
        .service
        .mark_product_status(&context.account_id, payload.product_id, payload.status)
        .await;
    Json(MarkStatusResponse { updated })
}

async fn query_product_statuses(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<StatusQueryRequest>,
) -> Result<Json<StatusQueryResponse>, AppError> {
    crate::metrics::inc_requests("/compliance/status/query");
    let statuses = state
        .service
        .product_statuses(&context.account_id, &payload.product_ids)
        .await?;
    Ok(Json(StatusQueryResponse {
        statuses: statuses
            .into_iter()
            .map(|(id, status)| (id.to_string(), status))
            .collect(),
    }))
}

/// Goods flagged by compliance review, with their marked status.
///
/// - Method: `GET`
/// - Path: `/compliance/list?page=1&page_size=20`
async fn compliance_list(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(query): Query<CompliancePageQuery>,
) -> Result<Json<ItemsResponse>, AppError> {
    crate::metrics::inc_requests("/compliance/list");
    let (page, page_size) = page_bounds(query.page, query.page_size)?;
    let items = state
        .service
        .compliance_list(&context.account_id, page, page_size)
        .await?;
    Ok(Json(ItemsResponse { items }))
}

async fn compliance_total(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(query): Query<CompliancePageQuery>,
) -> Result<Json<TotalResponse>, AppError> {
    crate::metrics::inc_requests("/compliance/total");
    let (page, page_size) = page_bounds(query.page, query.page_size)?;
    let total = state
        .service
        .compliance_total(&context.account_id, page, page_size)
        .await?;
    Ok(Json(TotalResponse { total }))
}

/// The seller's listings, filtered by `productIds` or `productName`.
///
/// - Method: `POST`
/// - Path: `/products`
/// - Body: `ProductQueryRequest`
async fn query_products(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<ProductQueryRequest>,
) -> Result<Json<ItemsResponse>, AppError> {
    crate::metrics::inc_requests("/products");
    page_bounds(payload.page, payload.page_size)?;
    let query = portal::api::ProductPageQuery::from(payload);
    let items = state
        .service
        .products(&context.account_id, &query)
        .await?;
    Ok(Json(ItemsResponse { items }))
}

fn page_bounds(page: u32, page_size: u32) -> Result<(u32, u32), AppError> {
    if page == 0 || page_size == 0 {
        return Err(AppError::InvalidInput("page and page size start at 1".into()));
    }
    Ok((page, page_size))
}

#[derive(Debug)]
enum AppError {
    Delist(DelistError),
    InvalidInput(String),
    NotFound(String),
    Unauthorized,
    Internal(ApiError),
}

impl From<DelistError> for AppError {
    fn from(value: DelistError) -> Self {
        Self::Delist(value)
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Delist(DelistError::MissingCredentials(_)) => StatusCode::NOT_FOUND,
            AppError::Delist(DelistError::Bootstrap(_)) => StatusCode::BAD_GATEWAY,
            AppError::Delist(DelistError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Delist(DelistError::Portal(_)) => StatusCode::BAD_GATEWAY,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let payload = match self {
            AppError::Delist(err) => {
                if let DelistError::Bootstrap(BootstrapError::Trigger(source)) = &err {
                    warn!(target = "delist.api", error = %source, "bootstrap trigger rejected");
                }
                ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.to_string()),
                }
            }
            AppError::InvalidInput(detail) => ApiError {
                error: "invalid_input".into(),
                detail: Some(detail),
            },
            AppError::NotFound(what) => ApiError {
                error: "not_found".into(),
                detail: Some(what),
            },
            AppError::Unauthorized => ApiError {
                error: "unauthorized".into(),
                detail: None,
            },
            AppError::Internal(err) => err,
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
