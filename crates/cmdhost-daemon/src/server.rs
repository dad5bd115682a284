//! HTTP server

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use cmdhost_core::protocol::{ErrorResponse, HealthResponse, RunCommandRequest};
use cmdhost_core::{CmdhostError, ExecutionRequest, WorkerPool, stream};
use std::sync::Arc;

/// Build the service's router around an owned worker pool
pub fn router(pool: Arc<WorkerPool>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/run-command", post(run_command))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(pool)
}

/// Run a command and stream back its result
async fn run_command(
    State(pool): State<Arc<WorkerPool>>,
    headers: HeaderMap,
    payload: Result<Json<RunCommandRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(wire) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let request = ExecutionRequest::try_from(wire)?;
    tracing::debug!(
        command = %request.display_command(),
        inputs = request.input_files.len(),
        outputs = request.output_files.len(),
        "run-command accepted"
    );

    let execution = pool.submit(request).await?;

    if wants_json(&headers) {
        let document = stream::buffer_json(execution).await?;
        return Ok(Json(document).into_response());
    }

    let multipart = stream::stream(execution, pool.config().chunk_size)?;
    Ok((
        [(header::CONTENT_TYPE, multipart.content_type())],
        Body::from_stream(multipart.into_body()),
    )
        .into_response())
}

/// Pool size and load; never takes a worker slot
async fn health(State(pool): State<Arc<WorkerPool>>) -> Json<HealthResponse> {
    let status = pool.status();
    Json(HealthResponse {
        status: "healthy".into(),
        workers: status.total,
        active_workers: status.busy,
        queued: status.queued,
    })
}

/// Whether the client asked for the buffered JSON form rather than multipart
fn wants_json(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
        return false;
    };

    accept
        .split(',')
        .filter_map(|item| item.split(';').next())
        .map(str::trim)
        .find(|media| *media == "application/json" || media.starts_with("multipart/"))
        == Some("application/json")
}

/// Error surfaced to HTTP clients
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "InvalidRequest",
            detail,
        }
    }
}

impl From<CmdhostError> for ApiError {
    fn from(e: CmdhostError) -> Self {
        let (status, kind) = match &e {
            CmdhostError::CommandNotFound(_) => (StatusCode::BAD_REQUEST, "CommandNotFound"),
            e if e.is_client_error() => (StatusCode::BAD_REQUEST, "InvalidRequest"),
            e if e.is_unavailable() => (StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        };

        if status.is_server_error() {
            tracing::error!(error = %e, "run-command failed");
        } else {
            tracing::debug!(error = %e, "run-command rejected");
        }

        Self {
            status,
            kind,
            detail: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.kind.to_string(),
            detail: self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn accept(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn negotiates_response_format() {
        assert!(!wants_json(&HeaderMap::new()));
        assert!(!wants_json(&accept("*/*")));
        assert!(wants_json(&accept("application/json")));
        assert!(wants_json(&accept("application/json; q=1, multipart/mixed")));
        assert!(!wants_json(&accept("multipart/mixed, application/json")));
    }

    #[test]
    fn maps_errors_to_status_codes() {
        let cases = [
            (CmdhostError::InvalidPath("../x".into()), StatusCode::BAD_REQUEST),
            (CmdhostError::CommandNotFound("x".into()), StatusCode::BAD_REQUEST),
            (CmdhostError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
            (CmdhostError::PoolExhausted { queued: 3 }, StatusCode::SERVICE_UNAVAILABLE),
            (CmdhostError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status, status);
        }
    }
}
