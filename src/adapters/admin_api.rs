//! Admin HTTP surface over the gateway runtimes.
//!
//! Bodies are camelCase JSON. Certificate material arrives as base64 PFX or
//! PEM text and is never echoed back or logged.
use std::{collections::BTreeMap, net::IpAddr, str::FromStr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::level_filters::LevelFilter;

use crate::{
    adapters::log_levels::LogLevelOverrides,
    core::{
        Admission, GatewayService,
        output_cache::OutputCacheConfig,
        policy::{IpVerdict, PolicyEntry, PolicyError, PolicyType},
        rate_limit::{RateLimitApplyError, RateLimitConfigDto, RejectionSnapshot},
        routes::{ClusterConfig, RouteConfig, RouteConfigError, RouteSnapshot},
        tenant::TenantResolution,
        tls::{DomainBinding, RotateRequest, RotationOutcome, TlsError},
    },
};

/// Shared state of the admin router.
#[derive(Clone)]
pub struct AdminState {
    pub gateway: Arc<GatewayService>,
    pub log_levels: Arc<LogLevelOverrides>,
}

/// Admin API failures mapped onto HTTP statuses.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
}

impl AdminError {
    fn status_code(&self) -> StatusCode {
        match self {
            AdminError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AdminError::NotFound(_) => StatusCode::NOT_FOUND,
            AdminError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<TlsError> for AdminError {
    fn from(e: TlsError) -> Self {
        AdminError::BadRequest(e.to_string())
    }
}

impl From<PolicyError> for AdminError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::Invalid { .. } => AdminError::BadRequest(e.to_string()),
            PolicyError::Store(report) => {
                tracing::error!(error = ?report, "Policy store call failed");
                AdminError::Unavailable("policy store unavailable".to_string())
            }
        }
    }
}

impl From<RouteConfigError> for AdminError {
    fn from(e: RouteConfigError) -> Self {
        match e {
            RouteConfigError::NothingToRollBack => AdminError::NotFound(e.to_string()),
            other => AdminError::BadRequest(other.to_string()),
        }
    }
}

impl From<RateLimitApplyError> for AdminError {
    fn from(e: RateLimitApplyError) -> Self {
        AdminError::BadRequest(e.to_string())
    }
}

type AdminResult<T> = Result<T, AdminError>;

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/admin/tenant", get(resolve_tenant))
        .route("/admin/admit", post(admit))
        .route("/admin/tls", get(list_bindings))
        .route(
            "/admin/tls/{host}",
            get(get_binding).put(bind_certificate).delete(remove_binding),
        )
        .route("/admin/tls/{host}/rotate", post(rotate_certificate))
        .route(
            "/admin/rate-limits",
            get(get_rate_limits).put(apply_rate_limits),
        )
        .route("/admin/rate-limits/rejections", get(last_rejections))
        .route("/admin/output-cache", get(get_output_cache).put(apply_output_cache))
        .route("/admin/policies", get(list_policies).put(replace_policies))
        .route("/admin/policies/evaluate", get(evaluate_ip))
        .route(
            "/admin/policies/{id}",
            get(get_policy).put(upsert_policy).delete(delete_policy),
        )
        .route("/admin/routes", get(get_routes).put(update_routes))
        .route("/admin/routes/rollback", post(rollback_routes))
        .route("/admin/log-levels", get(list_log_levels))
        .route(
            "/admin/log-levels/{category}",
            put(set_log_level).delete(clear_log_level),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct TenantQuery {
    host: String,
    #[serde(default)]
    path: String,
}

async fn resolve_tenant(
    State(state): State<AdminState>,
    Query(query): Query<TenantQuery>,
) -> Json<TenantResolution> {
    Json(state.gateway.tenants().resolve(&query.host, &query.path))
}

/// Dry-run admission of a request; consumes a permit like a real request would.
async fn admit(
    State(state): State<AdminState>,
    Query(query): Query<TenantQuery>,
) -> (StatusCode, Json<Admission>) {
    let admission = state.gateway.admit(&query.host, &query.path).await;
    let status = if admission.is_permitted() {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    (status, Json(admission))
}

async fn list_bindings(State(state): State<AdminState>) -> Json<Vec<DomainBinding>> {
    Json(state.gateway.tls().list().await)
}

async fn get_binding(
    State(state): State<AdminState>,
    Path(host): Path<String>,
) -> AdminResult<Json<DomainBinding>> {
    state
        .gateway
        .tls()
        .get(&host)
        .await
        .map(Json)
        .ok_or_else(|| AdminError::NotFound(format!("no certificate bound to '{host}'")))
}

/// Bind accepts the same body as rotate: a PFX bundle or PEM certificate and key.
async fn bind_certificate(
    State(state): State<AdminState>,
    Path(host): Path<String>,
    Json(request): Json<RotateRequest>,
) -> AdminResult<Json<DomainBinding>> {
    let material = request.into_material()?;
    Ok(Json(state.gateway.bind_certificate(&host, &material).await?))
}

async fn rotate_certificate(
    State(state): State<AdminState>,
    Path(host): Path<String>,
    Json(request): Json<RotateRequest>,
) -> AdminResult<Json<RotationOutcome>> {
    Ok(Json(state.gateway.rotate_certificate(&host, request).await?))
}

async fn remove_binding(
    State(state): State<AdminState>,
    Path(host): Path<String>,
) -> AdminResult<StatusCode> {
    if state.gateway.remove_certificate(&host).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AdminError::NotFound(format!("no certificate bound to '{host}'")))
    }
}

async fn get_rate_limits(State(state): State<AdminState>) -> Json<RateLimitConfigDto> {
    Json(state.gateway.rate_limits().snapshot())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionResponse {
    version: u64,
}

async fn apply_rate_limits(
    State(state): State<AdminState>,
    Json(dto): Json<Option<RateLimitConfigDto>>,
) -> AdminResult<Json<VersionResponse>> {
    let version = state.gateway.apply_rate_limits(dto.as_ref()).await?;
    Ok(Json(VersionResponse { version }))
}

async fn last_rejections(State(state): State<AdminState>) -> Json<Option<RejectionSnapshot>> {
    Json(state.gateway.rejections().last_snapshot())
}

async fn get_output_cache(State(state): State<AdminState>) -> Json<OutputCacheConfig> {
    Json(state.gateway.output_cache().get())
}

async fn apply_output_cache(
    State(state): State<AdminState>,
    Json(config): Json<OutputCacheConfig>,
) -> Json<OutputCacheConfig> {
    Json(state.gateway.apply_output_cache(config).await)
}

#[derive(Deserialize)]
struct PolicyQuery {
    #[serde(rename = "type")]
    policy_type: Option<String>,
}

async fn list_policies(
    State(state): State<AdminState>,
    Query(query): Query<PolicyQuery>,
) -> AdminResult<Json<Vec<PolicyEntry>>> {
    let policies = state.gateway.policies();
    match query.policy_type {
        Some(raw) => {
            let policy_type = PolicyType::from_str(&raw).map_err(AdminError::BadRequest)?;
            Ok(Json(policies.get_by_type(policy_type).await))
        }
        None => Ok(Json(policies.get_all().await)),
    }
}

async fn get_policy(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<Json<PolicyEntry>> {
    state
        .gateway
        .policies()
        .get_by_id(&id)
        .await
        .map(Json)
        .ok_or_else(|| AdminError::NotFound(format!("policy '{id}' not found")))
}

/// The path id wins over any id in the body.
async fn upsert_policy(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(mut entry): Json<PolicyEntry>,
) -> AdminResult<Json<PolicyEntry>> {
    entry.id = id;
    Ok(Json(state.gateway.upsert_policy(entry).await?))
}

async fn delete_policy(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<StatusCode> {
    if state.gateway.delete_policy(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AdminError::NotFound(format!("policy '{id}' not found")))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CountResponse {
    count: usize,
}

async fn replace_policies(
    State(state): State<AdminState>,
    Json(entries): Json<Vec<PolicyEntry>>,
) -> AdminResult<Json<CountResponse>> {
    let count = state.gateway.replace_policies(entries).await?;
    Ok(Json(CountResponse { count }))
}

#[derive(Deserialize)]
struct EvaluateQuery {
    ip: String,
}

async fn evaluate_ip(
    State(state): State<AdminState>,
    Query(query): Query<EvaluateQuery>,
) -> AdminResult<Json<IpVerdict>> {
    let ip = IpAddr::from_str(query.ip.trim())
        .map_err(|_| AdminError::BadRequest(format!("invalid IP address '{}'", query.ip)))?;
    Ok(Json(state.gateway.check_client_ip(ip).await))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoutesResponse {
    revision: u64,
    routes: Vec<RouteConfig>,
    clusters: Vec<ClusterConfig>,
    has_previous: bool,
}

async fn get_routes(State(state): State<AdminState>) -> Json<RoutesResponse> {
    let config = state.gateway.proxy().get_config();
    Json(RoutesResponse {
        revision: config.revision(),
        routes: config.routes().to_vec(),
        clusters: config.clusters().to_vec(),
        has_previous: state.gateway.routes().get_previous().is_some(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RevisionResponse {
    revision: u64,
}

async fn update_routes(
    State(state): State<AdminState>,
    Json(snapshot): Json<RouteSnapshot>,
) -> AdminResult<Json<RevisionResponse>> {
    let revision = state.gateway.update_routes(snapshot).await?;
    Ok(Json(RevisionResponse { revision }))
}

async fn rollback_routes(State(state): State<AdminState>) -> AdminResult<Json<RevisionResponse>> {
    let revision = state.gateway.rollback_routes().await?;
    Ok(Json(RevisionResponse { revision }))
}

async fn list_log_levels(State(state): State<AdminState>) -> Json<BTreeMap<String, String>> {
    Json(state.log_levels.list().await)
}

#[derive(Deserialize)]
struct LogLevelRequest {
    level: String,
}

async fn set_log_level(
    State(state): State<AdminState>,
    Path(category): Path<String>,
    Json(request): Json<LogLevelRequest>,
) -> AdminResult<StatusCode> {
    if category.trim().is_empty() {
        return Err(AdminError::BadRequest("category must not be empty".to_string()));
    }
    let level = LevelFilter::from_str(request.level.trim())
        .map_err(|_| AdminError::BadRequest(format!("invalid log level '{}'", request.level)))?;
    state.log_levels.set(&category, level).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_log_level(
    State(state): State<AdminState>,
    Path(category): Path<String>,
) -> AdminResult<StatusCode> {
    if state.log_levels.clear(&category).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AdminError::NotFound(format!("no override for '{category}'")))
    }
}
