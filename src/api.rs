use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{report, AuditSink, ComplianceReport, ReportPeriod};
use crate::error::{AppError, AppResult};
use crate::extractor::AdminUser;
use crate::keys::models::{KeyType, RotationJob, RotationPriority};
use crate::keys::service::{KeyRotationService, KeyTypeStatus};
use crate::ratelimit::{middleware::enforce, DistributedRateLimiter};
use crate::scheduler::{RotationScheduler, SchedulerStatus};

/// Shared services handed to the router as `Extension` layers.
#[derive(Clone)]
pub struct AppServices {
    pub limiter: Arc<DistributedRateLimiter>,
    pub keys: Arc<KeyRotationService>,
    pub scheduler: Arc<RotationScheduler>,
    pub audit: Arc<dyn AuditSink>,
}

/// key: guardrail-router
/// `/healthz` sits outside the limiter so health checks never consume quota.
pub fn router(services: &AppServices) -> Router {
    let limited = admin_routes().layer(middleware::from_fn_with_state(
        services.limiter.clone(),
        enforce,
    ));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(limited)
        .layer(Extension(services.limiter.clone()))
        .layer(Extension(services.keys.clone()))
        .layer(Extension(services.scheduler.clone()))
        .layer(Extension(services.audit.clone()))
}

/// key: admin-api
pub fn admin_routes() -> Router {
    Router::new()
        .route("/api/admin/scheduler", get(scheduler_status))
        .route("/api/admin/scheduler/pause", post(pause_scheduler))
        .route("/api/admin/scheduler/resume", post(resume_scheduler))
        .route("/api/admin/keys", get(list_keys))
        .route("/api/admin/keys/:key_type/rotate", post(request_rotation))
        .route(
            "/api/admin/keys/:key_type/migration/cancel",
            post(cancel_migration),
        )
        .route(
            "/api/admin/keys/:key_type/migration/:version/abandon",
            post(abandon_migration),
        )
        .route("/api/admin/compliance", get(compliance_report))
}

async fn healthz(
    Extension(limiter): Extension<Arc<DistributedRateLimiter>>,
) -> impl IntoResponse {
    match limiter.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok", "store": "ok"}))),
        Err(err) => {
            tracing::warn!(?err, "rate limit store health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "store": "unavailable",
                    "failure_mode": limiter.failure_mode().as_str(),
                })),
            )
        }
    }
}

async fn scheduler_status(
    _admin: AdminUser,
    Extension(scheduler): Extension<Arc<RotationScheduler>>,
) -> AppResult<Json<SchedulerStatus>> {
    Ok(Json(scheduler.status().await?))
}

async fn pause_scheduler(
    admin: AdminUser,
    Extension(scheduler): Extension<Arc<RotationScheduler>>,
) -> StatusCode {
    scheduler.pause(&admin.subject).await;
    StatusCode::NO_CONTENT
}

async fn resume_scheduler(
    admin: AdminUser,
    Extension(scheduler): Extension<Arc<RotationScheduler>>,
) -> StatusCode {
    scheduler.resume(&admin.subject).await;
    StatusCode::NO_CONTENT
}

async fn list_keys(
    _admin: AdminUser,
    Extension(keys): Extension<Arc<KeyRotationService>>,
) -> AppResult<Json<Vec<KeyTypeStatus>>> {
    Ok(Json(keys.status().await?))
}

#[derive(Debug, Deserialize)]
pub struct RotateRequest {
    pub reason: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct RotateResponse {
    pub queued: bool,
    pub job: Option<RotationJob>,
}

async fn request_rotation(
    admin: AdminUser,
    Extension(scheduler): Extension<Arc<RotationScheduler>>,
    Path(key_type): Path<String>,
    Json(payload): Json<RotateRequest>,
) -> AppResult<(StatusCode, Json<RotateResponse>)> {
    let key_type = parse_key_type(&key_type)?;
    let priority = match payload.priority.as_deref() {
        Some(value) => RotationPriority::from_str(value)
            .ok_or_else(|| AppError::BadRequest(format!("unknown priority {value}")))?,
        None => RotationPriority::High,
    };
    if payload.reason.trim().is_empty() {
        return Err(AppError::BadRequest("reason is required".into()));
    }

    let reason = format!("{} (requested by {})", payload.reason.trim(), admin.subject);
    let job = scheduler
        .request_rotation(key_type, priority, &reason, payload.force)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RotateResponse {
            queued: job.is_some(),
            job,
        }),
    ))
}

async fn cancel_migration(
    _admin: AdminUser,
    Extension(keys): Extension<Arc<KeyRotationService>>,
    Path(key_type): Path<String>,
) -> AppResult<StatusCode> {
    let key_type = parse_key_type(&key_type)?;
    if keys.cancel_migration(key_type) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(AppError::NotFound)
    }
}

#[derive(Debug, Deserialize)]
pub struct AbandonRequest {
    pub reason: String,
}

async fn abandon_migration(
    admin: AdminUser,
    Extension(keys): Extension<Arc<KeyRotationService>>,
    Path((key_type, version)): Path<(String, u32)>,
    Json(payload): Json<AbandonRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let key_type = parse_key_type(&key_type)?;
    let reason = format!("{} (abandoned by {})", payload.reason.trim(), admin.subject);
    let remaining = keys.abandon_migration(key_type, version, &reason).await?;
    Ok(Json(json!({
        "key_type": key_type,
        "from_version": version,
        "remaining_records": remaining,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ComplianceQuery {
    pub period: Option<String>,
}

async fn compliance_report(
    _admin: AdminUser,
    Extension(audit): Extension<Arc<dyn AuditSink>>,
    Query(query): Query<ComplianceQuery>,
) -> AppResult<Json<ComplianceReport>> {
    let period = match query.period.as_deref() {
        Some(value) => ReportPeriod::from_str(value)
            .ok_or_else(|| AppError::BadRequest(format!("unknown period {value}")))?,
        None => ReportPeriod::Daily,
    };
    Ok(Json(report::generate(audit.as_ref(), period, Utc::now()).await?))
}

fn parse_key_type(value: &str) -> AppResult<KeyType> {
    KeyType::from_str(value).ok_or(AppError::NotFound)
}
