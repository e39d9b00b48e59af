use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::environment::{CreateParams, EnvironmentId, InitParams};

use super::{environment_error_response, ok_response, with_status, ApiState};

pub fn routes() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/environments/list", get(list_environments))
        .route("/environments/create", post(create_environment))
        .route("/environments/init", post(init_environment))
        .route("/environments/up/{id}", post(up))
        .route("/environments/halt/{id}", post(halt))
        .route("/environments/suspend/{id}", post(suspend))
        .route("/environments/resume/{id}", post(resume))
        .route("/environments/reload/{id}", post(reload))
        .route("/environments/provision/{id}", post(provision))
        .route("/environments/destroy/{id}", delete(destroy_machines))
        .route("/environments/purge/{id}", post(purge))
        .route("/environments/status/{id}", get(status))
        .route("/environments/addresses/{id}", get(addresses))
}

#[derive(Deserialize)]
struct CreateRequest {
    box_name: String,
    box_url: Option<String>,
    user_data_script: Option<String>,
}

#[derive(Deserialize, Default)]
struct InitRequest {
    box_name: Option<String>,
    box_url: Option<String>,
    vagrantfile: Option<String>,
}

/// Optional knobs shared by the lifecycle routes.
#[derive(Deserialize, Default)]
struct LifecycleQuery {
    vm_name: Option<String>,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    no_provision: bool,
}

#[derive(Serialize)]
struct IdResponse {
    id: EnvironmentId,
}

async fn list_environments(State(state): State<Arc<ApiState>>) -> Response {
    match state.manager.list().await {
        Ok(ids) => ok_response(ids),
        Err(e) => environment_error_response(e),
    }
}

async fn create_environment(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateRequest>,
) -> Response {
    let params = CreateParams {
        box_name: Some(req.box_name),
        box_url: req.box_url,
        scripts: req.user_data_script.into_iter().collect(),
    };
    match state.manager.create(params).await {
        Ok(created) => with_status(StatusCode::CREATED, created),
        Err(e) => environment_error_response(e),
    }
}

async fn init_environment(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<InitRequest>,
) -> Response {
    let params = InitParams {
        box_name: req.box_name,
        box_url: req.box_url,
        vagrantfile: req.vagrantfile,
    };
    match state.manager.init(params).await {
        Ok(id) => with_status(StatusCode::CREATED, IdResponse { id }),
        Err(e) => environment_error_response(e),
    }
}

fn queued(result: Result<EnvironmentId, crate::environment::EnvironmentError>) -> Response {
    match result {
        Ok(id) => with_status(StatusCode::ACCEPTED, IdResponse { id }),
        Err(e) => environment_error_response(e),
    }
}

async fn up(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(q): Query<LifecycleQuery>,
) -> Response {
    queued(state.manager.up(&id, q.vm_name.as_deref(), q.no_provision).await)
}

async fn halt(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(q): Query<LifecycleQuery>,
) -> Response {
    queued(state.manager.halt(&id, q.vm_name.as_deref(), q.force).await)
}

async fn suspend(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(q): Query<LifecycleQuery>,
) -> Response {
    queued(state.manager.suspend(&id, q.vm_name.as_deref()).await)
}

async fn resume(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(q): Query<LifecycleQuery>,
) -> Response {
    queued(state.manager.resume(&id, q.vm_name.as_deref()).await)
}

async fn reload(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(q): Query<LifecycleQuery>,
) -> Response {
    queued(state.manager.reload(&id, q.vm_name.as_deref(), q.no_provision).await)
}

async fn provision(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(q): Query<LifecycleQuery>,
) -> Response {
    queued(state.manager.provision(&id, q.vm_name.as_deref()).await)
}

async fn destroy_machines(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(q): Query<LifecycleQuery>,
) -> Response {
    queued(state.manager.destroy_machines(&id, q.vm_name.as_deref()).await)
}

async fn purge(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    match state.manager.destroy_environment(&id).await {
        Ok(()) => ok_response(serde_json::json!({ "id": id })),
        Err(e) => environment_error_response(e),
    }
}

async fn status(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    match state.manager.status(&id).await {
        Ok(machines) => ok_response(serde_json::json!({ "status": machines })),
        Err(e) => environment_error_response(e),
    }
}

async fn addresses(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    match state.manager.addresses(&id).await {
        Ok(addr) => ok_response(serde_json::json!({ "id": id, "ips": Vec::from_iter(addr) })),
        Err(e) => environment_error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::{body_json, test_api};
    use crate::vagrant::MachineState;

    async fn create(state: &Arc<ApiState>, box_name: &str) -> Response {
        create_environment(
            State(state.clone()),
            Json(CreateRequest {
                box_name: box_name.into(),
                box_url: None,
                user_data_script: Some("echo hi".into()),
            }),
        )
        .await
    }

    #[tokio::test]
    async fn create_returns_id_and_ips() {
        let api = test_api("10.0.0.0/30");
        let resp = create(&api.state, "precise32").await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["ips"], serde_json::json!(["10.0.0.1"]));
        let id = body["data"]["id"].as_str().unwrap();
        assert!(EnvironmentId::parse(id).is_ok());
        assert_eq!(api.state.manager.queue().depth(), 1);
    }

    #[tokio::test]
    async fn create_when_exhausted_is_503() {
        let api = test_api("10.0.0.0/31");
        assert_eq!(create(&api.state, "a").await.status(), StatusCode::CREATED);
        assert_eq!(create(&api.state, "b").await.status(), StatusCode::CREATED);
        let resp = create(&api.state, "c").await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], "ADDRESS_RANGE_EXHAUSTED");
    }

    #[tokio::test]
    async fn create_with_bad_box_name_is_400() {
        let api = test_api("10.0.0.0/30");
        let resp = create(&api.state, "../box").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn lifecycle_on_unknown_environment_is_404() {
        let api = test_api("10.0.0.0/30");
        let resp = halt(
            State(api.state.clone()),
            Path("0b7e1e2a-5c1d-4f7e-9a55-2c7e7f0b1d3a".into()),
            Query(LifecycleQuery::default()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = halt(
            State(api.state.clone()),
            Path("not-an-id".into()),
            Query(LifecycleQuery::default()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn lifecycle_is_accepted_and_queued() {
        let api = test_api("10.0.0.0/30");
        let body = body_json(create(&api.state, "precise32").await).await;
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let resp = up(
            State(api.state.clone()),
            Path(id.clone()),
            Query(LifecycleQuery {
                vm_name: Some("web".into()),
                no_provision: true,
                ..LifecycleQuery::default()
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["data"]["id"], id.as_str());
        assert_eq!(api.state.manager.queue().depth(), 2);
    }

    #[tokio::test]
    async fn purge_conflicts_while_machines_exist() {
        let api = test_api("10.0.0.0/30");
        let body = body_json(create(&api.state, "precise32").await).await;
        let id = body["data"]["id"].as_str().unwrap().to_string();

        api.tool.set_status("default", MachineState::Poweroff);
        let resp = purge(State(api.state.clone()), Path(id.clone())).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        api.tool.set_status("default", MachineState::NotCreated);
        let resp = purge(State(api.state.clone()), Path(id.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let list = body_json(list_environments(State(api.state.clone())).await).await;
        assert_eq!(list["data"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn status_reports_machine_states() {
        let api = test_api("10.0.0.0/30");
        let body = body_json(create(&api.state, "precise32").await).await;
        let id = body["data"]["id"].as_str().unwrap().to_string();
        api.tool.set_status("default", MachineState::Running);

        let resp = status(State(api.state.clone()), Path(id)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["status"]["default"], "running");
    }

    #[tokio::test]
    async fn init_with_vagrantfile_lists_environment() {
        let api = test_api("10.0.0.0/30");
        let resp = init_environment(
            State(api.state.clone()),
            Json(InitRequest {
                vagrantfile: Some("# empty\n".into()),
                ..InitRequest::default()
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let id = body_json(resp).await["data"]["id"].clone();

        let list = body_json(list_environments(State(api.state.clone())).await).await;
        assert_eq!(list["data"], serde_json::json!([id]));

        let resp = addresses(State(api.state.clone()), Path(id.as_str().unwrap().into())).await;
        assert_eq!(body_json(resp).await["data"]["ips"], serde_json::json!([]));
    }
}
