use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Response, routing::get, Router};

use crate::vagrant::list_vms;

use super::{environment_error_response, error_response, ok_response, with_status, ApiState};

pub fn routes() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/system/health", get(health))
        .route("/vms/registered", get(registered_vms))
        .route("/vms/running", get(running_vms))
}

/// Worker liveness plus queue and pool occupancy. A worker that stopped or
/// died means queued commands will never run, so that is reported as 503.
async fn health(State(state): State<Arc<ApiState>>) -> Response {
    let worker = *state.worker_state.borrow();
    // A closed channel means the worker task is gone, whatever it last reported.
    let worker_alive = state.worker_state.has_changed().is_ok();
    let pool = match state.manager.allocator().usage().await {
        Ok(usage) => usage,
        Err(e) => return environment_error_response(e.into()),
    };

    let healthy = worker_alive && !worker.is_terminal();
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "worker": worker,
        "worker_alive": worker_alive,
        "queue_depth": state.manager.queue().depth(),
        "pool": pool,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    with_status(status, body)
}

async fn vms(state: &ApiState, running_only: bool) -> Response {
    match list_vms(&state.vboxmanage_binary, running_only).await {
        Ok(vms) => ok_response(serde_json::json!({ "vms": vms })),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            format!("{:#}", e),
        ),
    }
}

async fn registered_vms(State(state): State<Arc<ApiState>>) -> Response {
    vms(&state, false).await
}

async fn running_vms(State(state): State<Arc<ApiState>>) -> Response {
    vms(&state, true).await
}
