//! HTTP surface
//!
//! | Route | Scope | |
//! |---|---|---|
//! | `POST /usage` | `usage:write` | usage report ingress |
//! | `POST /schema/check` | `registry:read` | check a schema against the latest one |
//! | `POST /schema/publish` | `registry:write` | check and store a schema |
//! | `GET /schema/latest` | `registry:read` | latest published schema |
//! | `GET /operations` | `registry:read` | per-operation stats |
//! | `PUT /targets/validation` | `target:settings` | toggle usage validation |
//! | `PUT /targets/validation/settings` | `target:settings` | replace validation settings |
//! | `GET /health` | | liveness |
//!
//! Every authenticated route acts on the target of the request's token.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{bearer_token, MemoryTokenStore, RequestContext, Scope, TokenVerifier};
use crate::collector::UsageCollector;
use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::ingest::{ConsumerHandle, IngestionConsumer};
use crate::inspector::Inspector;
use crate::metrics;
use crate::normalize::OperationNormalizer;
use crate::queue::MemoryQueue;
use crate::registry::{PublishInput, SchemaCheckResult, SchemaPublishResult, SchemaRegistry};
use crate::settings::{MemorySettingsStore, SettingsResolver, ValidationSettings, DEFAULT_PERIOD_DAYS, MAX_PERIOD_DAYS};
use crate::store::{MemoryUsageStore, OperationStats, Period, UsageReader, UsageWriter};
use crate::usage::{OperationReport, TargetId};
use crate::version::SchemaVersion;

/// API error types
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Registry(e) => match e {
                RegistryError::InvalidOperation(_)
                | RegistryError::InvalidEnvelope(_)
                | RegistryError::InvalidSchema(_)
                | RegistryError::InvalidSettings(_)
                | RegistryError::Json(_)
                | RegistryError::Semver(_) => StatusCode::BAD_REQUEST,
                RegistryError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                RegistryError::Forbidden { .. } => StatusCode::FORBIDDEN,
                RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
                RegistryError::QueueUnavailable(_)
                | RegistryError::TransientStore(_)
                | RegistryError::UsageLookupTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
                RegistryError::Store(_) | RegistryError::Io(_) | RegistryError::Config(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Registry(e) => match e {
                RegistryError::InvalidOperation(_) => "INVALID_OPERATION",
                RegistryError::InvalidEnvelope(_) => "INVALID_ENVELOPE",
                RegistryError::InvalidSchema(_) => "INVALID_SCHEMA",
                RegistryError::InvalidSettings(_) => "INVALID_SETTINGS",
                RegistryError::Json(_) | RegistryError::Semver(_) => "BAD_REQUEST",
                RegistryError::Unauthorized(_) => "UNAUTHORIZED",
                RegistryError::Forbidden { .. } => "FORBIDDEN",
                RegistryError::NotFound(_) => "NOT_FOUND",
                RegistryError::QueueUnavailable(_) => "QUEUE_UNAVAILABLE",
                RegistryError::TransientStore(_) | RegistryError::UsageLookupTimeout { .. } => {
                    "UNAVAILABLE"
                }
                RegistryError::Store(_) | RegistryError::Io(_) | RegistryError::Config(_) => {
                    "INTERNAL_ERROR"
                }
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Registry(e) if e.is_retryable())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "request failed");
        } else {
            debug!(status = status.as_u16(), error = %self, "request rejected");
        }

        let body = ErrorResponse {
            code: self.error_code().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Shared handler state
pub struct AppState {
    pub verifier: Arc<dyn TokenVerifier>,
    pub collector: UsageCollector,
    pub registry: Arc<SchemaRegistry>,
    pub settings: SettingsResolver,
    pub reader: Arc<dyn UsageReader>,
}

/// Build the router over `state`
pub fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/usage", post(collect_usage))
        .route("/schema/check", post(check_schema))
        .route("/schema/publish", post(publish_schema))
        .route("/schema/latest", get(latest_schema))
        .route("/operations", get(operations_stats))
        .route("/targets/validation", put(set_target_validation))
        .route("/targets/validation/settings", put(update_target_validation_settings))
        .layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> ApiResult<RequestContext> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| RegistryError::Unauthorized("missing bearer token".to_string()))?;
    Ok(RequestContext::authenticate(state.verifier.as_ref(), token).await?)
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `POST /usage` body: a bare array or `{"operations": [...]}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UsageEnvelope {
    Reports(Vec<Value>),
    Wrapped { operations: Vec<Value> },
}

impl UsageEnvelope {
    fn into_items(self) -> Vec<Value> {
        match self {
            UsageEnvelope::Reports(items) | UsageEnvelope::Wrapped { operations: items } => items,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UsageResponse {
    pub id: Option<Uuid>,
    pub operations: UsageCounts,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UsageCounts {
    pub accepted: usize,
    pub rejected: usize,
}

async fn collect_usage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<UsageEnvelope>, JsonRejection>,
) -> ApiResult<Json<UsageResponse>> {
    let ctx = authenticate(&state, &headers).await?;
    ctx.require(Scope::UsageWrite)?;
    let Json(envelope) = body?;

    let items = envelope.into_items();
    let limit = state.collector.max_batch_size();
    if items.len() > limit {
        return Err(RegistryError::InvalidEnvelope(format!(
            "batch of {} reports exceeds the limit of {}",
            items.len(),
            limit
        ))
        .into());
    }

    // Items that are not reports at all are rejected like unparsable operations
    let mut undecodable = 0;
    let reports: Vec<OperationReport> = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(report) => Some(report),
            Err(e) => {
                undecodable += 1;
                debug!(request = %ctx.request_id, error = %e, "dropping undecodable usage report");
                None
            }
        })
        .collect();
    if undecodable > 0 {
        metrics::record_reports(0, undecodable);
    }

    let report = state.collector.collect_for(&ctx, reports).await?;
    Ok(Json(UsageResponse {
        id: report.batch_id,
        operations: UsageCounts {
            accepted: report.accepted,
            rejected: report.rejected + undecodable,
        },
    }))
}

#[derive(Debug, Deserialize)]
struct CheckRequest {
    sdl: String,
    #[serde(default)]
    service: Option<String>,
}

async fn check_schema(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<CheckRequest>, JsonRejection>,
) -> ApiResult<Json<SchemaCheckResult>> {
    let ctx = authenticate(&state, &headers).await?;
    ctx.require(Scope::RegistryRead)?;
    let Json(request) = body?;

    let result = state
        .registry
        .check_schema(&ctx.target, &request.sdl, request.service.as_deref())
        .await;
    Ok(Json(result))
}

async fn publish_schema(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<PublishInput>, JsonRejection>,
) -> ApiResult<Json<SchemaPublishResult>> {
    let ctx = authenticate(&state, &headers).await?;
    ctx.require(Scope::RegistryWrite)?;
    let Json(input) = body?;

    Ok(Json(state.registry.publish_schema(&ctx.target, input).await))
}

async fn latest_schema(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<SchemaVersion>> {
    let ctx = authenticate(&state, &headers).await?;
    ctx.require(Scope::RegistryRead)?;

    state
        .registry
        .latest(&ctx.target)
        .map(Json)
        .ok_or_else(|| RegistryError::NotFound(format!("no schema published for {}", ctx.target)).into())
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    #[serde(default = "default_stats_days")]
    days: u32,
}

fn default_stats_days() -> u32 {
    DEFAULT_PERIOD_DAYS
}

async fn operations_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<Vec<OperationStats>>> {
    let ctx = authenticate(&state, &headers).await?;
    ctx.require(Scope::RegistryRead)?;

    if !(1..=MAX_PERIOD_DAYS).contains(&query.days) {
        return Err(ApiError::BadRequest(format!(
            "days must be between 1 and {}, got {}",
            MAX_PERIOD_DAYS, query.days
        )));
    }

    let period = Period::last_days(query.days, Utc::now());
    let stats = state
        .reader
        .read_operations_stats(std::slice::from_ref(&ctx.target), &period)
        .await?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
struct SetValidationRequest {
    enabled: bool,
}

async fn set_target_validation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<SetValidationRequest>, JsonRejection>,
) -> ApiResult<Json<ValidationSettings>> {
    let ctx = authenticate(&state, &headers).await?;
    ctx.require(Scope::TargetSettings)?;
    let Json(request) = body?;

    let settings = state
        .settings
        .set_target_validation(&ctx.target, request.enabled)
        .await?;
    info!(target_id = %ctx.target, enabled = request.enabled, "target validation changed");
    Ok(Json(settings))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateValidationSettingsRequest {
    percentage: f64,
    period_days: u32,
    target_ids: Vec<TargetId>,
    #[serde(default)]
    excluded_clients: Vec<String>,
}

async fn update_target_validation_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<UpdateValidationSettingsRequest>, JsonRejection>,
) -> ApiResult<Json<ValidationSettings>> {
    let ctx = authenticate(&state, &headers).await?;
    ctx.require(Scope::TargetSettings)?;
    let Json(request) = body?;

    let settings = state
        .settings
        .update_target_validation_settings(
            &ctx.target,
            request.percentage,
            request.period_days,
            request.target_ids,
            request.excluded_clients,
        )
        .await?;
    info!(target_id = %ctx.target, "target validation settings updated");
    Ok(Json(settings))
}

/// The process: in-memory collaborators, consumer workers and handler state
pub struct App {
    pub state: Arc<AppState>,
    pub queue: Arc<MemoryQueue>,
    pub store: Arc<MemoryUsageStore>,
    pub consumer: Arc<IngestionConsumer>,
    pub tokens: Arc<MemoryTokenStore>,
    workers: ConsumerHandle,
    purge: JoinHandle<()>,
    max_body_bytes: usize,
}

impl App {
    /// Wire everything from `config` and start the consumer workers; must
    /// run inside a tokio runtime
    pub fn build(config: &RegistryConfig) -> Self {
        let tokens = Arc::new(MemoryTokenStore::new());
        for token in &config.tokens {
            tokens.insert(token.token.clone(), token.target.clone(), token.scopes.clone());
        }

        let (queue, partitions) =
            MemoryQueue::new(config.ingestion.workers, config.ingestion.queue_capacity);
        let store = Arc::new(
            MemoryUsageStore::new().with_rollup_retention_days(config.store.rollup_retention_days),
        );

        let consumer = Arc::new(
            IngestionConsumer::new(store.clone())
                .with_retry_policy(config.ingestion.retry_policy())
                .with_dead_letter_capacity(config.ingestion.dead_letter_capacity),
        );
        let workers = consumer.clone().spawn(partitions);
        let purge = spawn_purge(
            store.clone(),
            Duration::from_secs(config.store.purge_interval_secs.max(1)),
        );

        let settings = SettingsResolver::new(Arc::new(MemorySettingsStore::new()));
        let inspector = Inspector::new(store.clone(), settings.clone())
            .with_usage_timeout(Duration::from_millis(config.inspector.usage_timeout_ms));
        let registry = Arc::new(SchemaRegistry::new(inspector));

        let collector = UsageCollector::new(
            tokens.clone(),
            queue.clone(),
            OperationNormalizer::new(config.normalizer),
        )
        .with_max_batch_size(config.collector.max_batch_size)
        .with_event_ttl_days(config.ingestion.event_ttl_days);

        let state = Arc::new(AppState {
            verifier: tokens.clone(),
            collector,
            registry,
            settings,
            reader: store.clone(),
        });

        info!(
            workers = workers.workers(),
            tokens = config.tokens.len(),
            "usage registry assembled"
        );

        Self {
            state,
            queue,
            store,
            consumer,
            tokens,
            workers,
            purge,
            max_body_bytes: config.server.max_body_bytes,
        }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone(), self.max_body_bytes)
    }

    /// Stop accepting usage, drain the queue and wait for the workers
    pub async fn shutdown(self) {
        self.purge.abort();
        self.queue.close();
        self.workers.join().await;

        let stats = self.consumer.stats();
        info!(
            batches = stats.batches_processed,
            events = stats.events_written,
            dead_letters = stats.dead_letters,
            "ingestion drained"
        );
    }
}

fn spawn_purge(store: Arc<dyn UsageWriter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // the first tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge_expired(Utc::now()).await {
                Ok(report) => debug!(
                    events = report.events,
                    rollups = report.rollups,
                    records = report.records,
                    "purged expired usage"
                ),
                Err(e) => warn!(error = %e, "failed to purge expired usage"),
            }
        }
    })
}
