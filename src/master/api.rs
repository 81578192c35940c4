//! HTTP front end for submitting and inspecting tasks.
//!
//! | Method | Path               | Effect                          |
//! |--------|--------------------|---------------------------------|
//! | GET    | `/health`          | liveness and pool size          |
//! | POST   | `/tasks`           | `assign_new_task`, 201 or 503   |
//! | GET    | `/tasks`           | every task in the table         |
//! | GET    | `/tasks/:id`       | one task                        |
//! | POST   | `/tasks/:id/retry` | place a pending task again      |
//! | GET    | `/slaves`          | monitoring view of the pool     |

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::common::messages::{base64_bytes, TaskId};
use crate::master::error::MasterError;
use crate::master::master::Master;
use crate::master::slave::{SlaveKey, SlaveView};
use crate::master::task::TaskView;

#[derive(Debug, Deserialize)]
pub struct SubmitTask {
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub load: u64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct SubmitResponse {
    pub id: TaskId,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct RetryResponse {
    pub id: TaskId,
    pub assigned_to: SlaveKey,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: MasterError) -> ApiError {
    let (status, id) = match &err {
        MasterError::Placement { task_id, .. } => (StatusCode::SERVICE_UNAVAILABLE, Some(*task_id)),
        MasterError::TaskNotFound(id) => (StatusCode::NOT_FOUND, Some(*id)),
        MasterError::TaskNotPending(id, _) => (StatusCode::CONFLICT, Some(*id)),
        MasterError::TaskUnassigned(id) => (StatusCode::CONFLICT, Some(*id)),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            id,
        }),
    )
}

pub fn router(master: Arc<Master>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/tasks", post(submit_task).get(list_tasks))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/retry", post(retry_task))
        .route("/slaves", get(list_slaves))
        .layer(CorsLayer::permissive())
        .with_state(master)
}

/// Serve the API until `shutdown` fires.
pub(crate) async fn serve(master: Arc<Master>, listener: TcpListener, shutdown: CancellationToken) {
    let app = router(master);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    match served {
        Ok(()) => info!("Task API stopped"),
        Err(e) => error!("❌ Task API failed: {}", e),
    }
}

async fn health_check(State(master): State<Arc<Master>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "policy": master.policy().as_str(),
        "slaves": master.pool().len().await,
    }))
}

pub async fn submit_task(
    State(master): State<Arc<Master>>,
    Json(request): Json<SubmitTask>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    debug!(
        "📥 Task submitted over HTTP ({} bytes, load {})",
        request.payload.len(),
        request.load
    );
    let id = master
        .assign_new_task(request.payload, request.load)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { id })))
}

pub async fn list_tasks(State(master): State<Arc<Master>>) -> Json<Vec<TaskView>> {
    Json(master.tasks().views().await)
}

pub async fn get_task(
    State(master): State<Arc<Master>>,
    Path(id): Path<TaskId>,
) -> Result<Json<TaskView>, ApiError> {
    master
        .task_view(id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(MasterError::TaskNotFound(id)))
}

pub async fn retry_task(
    State(master): State<Arc<Master>>,
    Path(id): Path<TaskId>,
) -> Result<Json<RetryResponse>, ApiError> {
    let assigned_to = master.retry_task(id).await.map_err(api_error)?;
    Ok(Json(RetryResponse { id, assigned_to }))
}

pub async fn list_slaves(State(master): State<Arc<Master>>) -> Json<Vec<SlaveView>> {
    Json(master.slave_views().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::MasterConfig;
    use crate::common::messages::TaskStatus;
    use crate::master::balancer::PolicyKind;
    use crate::master::slave::tests::{fast_timing, test_slave};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_master() -> Arc<Master> {
        let mut config = MasterConfig::default();
        config.master.advertise_address = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        config.timing = fast_timing();
        Master::with_policy(config, PolicyKind::FirstAvailable).unwrap()
    }

    #[test]
    fn submit_body_carries_base64_payload() {
        let request: SubmitTask =
            serde_json::from_str(r#"{"payload":"aGVsbG8=","load":3}"#).unwrap();
        assert_eq!(request.payload, b"hello".to_vec());
        assert_eq!(request.load, 3);

        let request: SubmitTask = serde_json::from_str(r#"{"payload":""}"#).unwrap();
        assert_eq!(request.load, 0);
    }

    #[tokio::test]
    async fn submit_without_slaves_is_unavailable() {
        let master = test_master();
        let request = SubmitTask {
            payload: b"x".to_vec(),
            load: 1,
        };
        let (status, Json(body)) = submit_task(State(Arc::clone(&master)), Json(request))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let id = body.id.expect("pending task id is reported");

        let Json(view) = get_task(State(Arc::clone(&master)), Path(id)).await.unwrap();
        assert_eq!(view.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn submit_and_retry() {
        let master = test_master();
        let slave = test_slave(1, 1);
        master.pool().insert(Arc::clone(&slave)).await;

        let request = SubmitTask {
            payload: b"x".to_vec(),
            load: 1,
        };
        let (status, Json(body)) = submit_task(State(Arc::clone(&master)), Json(request))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = retry_task(State(Arc::clone(&master)), Path(body.id))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = get_task(State(Arc::clone(&master)), Path(999))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let Json(slaves) = list_slaves(State(Arc::clone(&master))).await;
        assert_eq!(slaves.len(), 1);
        assert_eq!(slaves[0].tasks, vec![body.id]);

        let Json(tasks) = list_tasks(State(master)).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].assigned_to, Some(slave.key()));
    }
}
