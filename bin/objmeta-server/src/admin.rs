//! Admin HTTP endpoint: health, Prometheus metrics and operator calls.

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use objmeta_coldstorage::{ArchiveClient, JobStatus};
use objmeta_common::{Bucket, Error, RequestContext};
use objmeta_meta::{FlushReport, MetadataService, UsageAccountant};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Shared state of the admin handlers
#[derive(Clone)]
pub struct AdminState {
    pub service: Arc<MetadataService>,
    pub accountant: Arc<UsageAccountant>,
    pub archive: Option<Arc<dyn ArchiveClient>>,
    pub archive_account: String,
}

/// Error response carrying the S3-style code
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(error = %self.0, "admin request failed");
        }
        let body = ErrorBody {
            code: self.0.s3_error_code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct UsageBody {
    bucket: String,
    usage: i64,
}

#[derive(Serialize)]
struct FlushBody {
    skipped: bool,
    flushed: usize,
    failed: usize,
    dropped: usize,
}

impl From<Option<FlushReport>> for FlushBody {
    fn from(report: Option<FlushReport>) -> Self {
        report.map_or(
            Self {
                skipped: true,
                flushed: 0,
                failed: 0,
                dropped: 0,
            },
            |r| Self {
                skipped: false,
                flushed: r.flushed,
                failed: r.failed,
                dropped: r.dropped,
            },
        )
    }
}

async fn health_check() -> &'static str {
    "OK"
}

/// Prometheus metrics endpoint handler
async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.accountant.metrics().export_prometheus(),
    )
}

async fn get_bucket(
    State(state): State<AdminState>,
    Path(bucket): Path<String>,
) -> Result<Json<Bucket>, ApiError> {
    let ctx = RequestContext::new();
    Ok(Json(state.service.get_bucket_info(&ctx, &bucket).await?))
}

async fn get_usage(
    State(state): State<AdminState>,
    Path(bucket): Path<String>,
) -> Result<Json<UsageBody>, ApiError> {
    let ctx = RequestContext::new();
    let usage = state.accountant.get_usage(&ctx, &bucket).await?;
    Ok(Json(UsageBody { bucket, usage }))
}

async fn flush_usage(State(state): State<AdminState>) -> Result<Json<FlushBody>, ApiError> {
    let ctx = RequestContext::background("admin-flush");
    let report = state.accountant.sync_dirty_usages(&ctx).await?;
    Ok(Json(report.into()))
}

async fn archive_job_status(
    State(state): State<AdminState>,
    Path((vault, job_id)): Path<(String, String)>,
) -> Result<Json<JobStatus>, ApiError> {
    let Some(archive) = &state.archive else {
        return Err(Error::Configuration("archive retrieval is not configured".into()).into());
    };
    let status = archive
        .job_status(&state.archive_account, &vault, &job_id)
        .await
        .map_err(Error::from)?;
    Ok(Json(status))
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/admin/buckets/{bucket}", get(get_bucket))
        .route("/admin/buckets/{bucket}/usage", get(get_usage))
        .route("/admin/usage/flush", post(flush_usage))
        .route("/admin/archive/{vault}/jobs/{job_id}", get(archive_job_status))
        .with_state(state)
}
