//! REST 接口：任务提交 / 查询 / 确认 / 取消 / 反馈 / 健康探针

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::core::{OrchestratorError, Orchestrator, TaskSnapshot};

/// 路由共享状态
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = Arc::new(ApiState { orchestrator });
    Router::new()
        .route("/tasks", post(submit_task))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/confirm", post(confirm_task))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/tasks/:id/feedback", post(submit_feedback))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    intent: String,
    role_scope: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    task_id: String,
}

/// POST /tasks：提交意图，返回 202 与 taskId，任务在后台驱动至终态
async fn submit_task(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SubmitRequest>,
) -> (StatusCode, Json<SubmitResponse>) {
    let task_id = state.orchestrator.submit(req.intent, req.role_scope).await;
    (StatusCode::ACCEPTED, Json(SubmitResponse { task_id }))
}

/// GET /tasks/:id：状态、Plan 摘要与最后一条 StepResult
async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskSnapshot>, (StatusCode, String)> {
    state
        .orchestrator
        .snapshot(&id)
        .await
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("task {id} not found")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmRequest {
    confirmation_token: String,
}

/// POST /tasks/:id/confirm：出示单次确认令牌；无效或过期返回 409
async fn confirm_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<ConfirmRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    match state.orchestrator.confirm(&id, &req.confirmation_token).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(OrchestratorError::InvalidToken) => {
            Err((StatusCode::CONFLICT, "token invalid or expired".to_string()))
        }
        Err(e) => Err(map_error(e)),
    }
}

/// POST /tasks/:id/cancel：消息驱动取消；在途 Step 被等待并补偿
async fn cancel_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .orchestrator
        .cancel(&id)
        .await
        .map(|()| StatusCode::ACCEPTED)
        .map_err(map_error)
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    rating: u8,
    notes: Option<String>,
}

/// POST /tasks/:id/feedback：1..=5 评分进入学习回路
async fn submit_feedback(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<FeedbackRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    if !(1..=5).contains(&req.rating) {
        return Err((StatusCode::BAD_REQUEST, "rating must be 1..=5".to_string()));
    }
    state
        .orchestrator
        .submit_feedback(&id, req.rating, req.notes)
        .await
        .map(|()| StatusCode::OK)
        .map_err(map_error)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    last_processed_at: i64,
}

/// GET /health：存活探针；处理活动过久停滞时上报 degraded
async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: state.orchestrator.health_status(),
        last_processed_at: state.orchestrator.last_processed_at(),
    })
}

fn map_error(e: OrchestratorError) -> (StatusCode, String) {
    let status = match e {
        OrchestratorError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::InvalidToken | OrchestratorError::TaskAlreadyTerminal(_) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}
