pub mod environments;
pub mod system;

use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tracing::{error, info};

use crate::environment::{EnvironmentError, EnvironmentManager};
use crate::network::AllocError;
use crate::tasks::WorkerState;

/// Shared state for all handlers, passed via axum `State`.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<EnvironmentManager>,
    pub worker_state: watch::Receiver<WorkerState>,
    pub vboxmanage_binary: PathBuf,
}

/// Response envelope for successful API responses.
#[derive(serde::Serialize)]
pub struct ApiResponse<T: serde::Serialize> {
    pub data: T,
    pub meta: ApiMeta,
}

/// Response envelope for error API responses.
#[derive(serde::Serialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
    pub meta: ApiMeta,
}

#[derive(serde::Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(serde::Serialize)]
pub struct ApiMeta {
    pub request_id: String,
}

impl ApiMeta {
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            meta: ApiMeta::new(),
        }
    }
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
            },
            meta: ApiMeta::new(),
        }
    }
}

pub fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, axum::Json(ApiError::new(code, message))).into_response()
}

pub fn ok_response<T: serde::Serialize>(data: T) -> Response {
    with_status(StatusCode::OK, data)
}

pub fn with_status<T: serde::Serialize>(status: StatusCode, data: T) -> Response {
    (status, axum::Json(ApiResponse::new(data))).into_response()
}

/// HTTP status and error code for a failed environment operation.
fn classify(err: &EnvironmentError) -> (StatusCode, &'static str) {
    match err {
        EnvironmentError::InvalidId(_) => (StatusCode::BAD_REQUEST, "INVALID_ID"),
        EnvironmentError::InvalidBoxName(_) => (StatusCode::BAD_REQUEST, "INVALID_BOX_NAME"),
        EnvironmentError::InvalidMachineName(_) => (StatusCode::BAD_REQUEST, "INVALID_VM_NAME"),
        EnvironmentError::AlreadyExists(_) => (StatusCode::CONFLICT, "ALREADY_EXISTS"),
        EnvironmentError::NotClean(_) => (StatusCode::CONFLICT, "NOT_CLEAN"),
        EnvironmentError::UnknownEnvironment(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        EnvironmentError::Address(AllocError::AddressRangeExhausted { .. }) => {
            (StatusCode::SERVICE_UNAVAILABLE, "ADDRESS_RANGE_EXHAUSTED")
        }
        EnvironmentError::Address(AllocError::DuplicateClaim(_)) => {
            (StatusCode::CONFLICT, "DUPLICATE_CLAIM")
        }
        EnvironmentError::Address(AllocError::UnknownEnvironment(_)) => {
            (StatusCode::NOT_FOUND, "NOT_FOUND")
        }
        EnvironmentError::Address(_) | EnvironmentError::Other(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
        }
    }
}

pub fn environment_error_response(err: EnvironmentError) -> Response {
    let (status, code) = classify(&err);
    if status.is_server_error() {
        error!(error = %format!("{:#}", err), code, "request failed");
    }
    error_response(status, code, format!("{:#}", err))
}

async fn root() -> Response {
    ok_response(serde_json::json!({}))
}

pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(environments::routes())
        .merge(system::routes())
        .with_state(state)
}

/// Serve the API until `shutdown` resolves, then stop accepting requests and
/// let in-flight ones finish.
pub async fn serve(
    state: Arc<ApiState>,
    bind_addr: &str,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let addr = format!("{}:{}", bind_addr, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "api server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("api server error")
}
