use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::automation::FireDecision;
use crate::error::{ApiResult, AppError};
use crate::AppState;
use ndis_shared::{AuditEntry, WorkflowStatusView};

const DEFAULT_LOG_LIMIT: i64 = 50;
const MAX_LOG_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub workflow: String,
    /// "fired" or "skipped"
    pub status: String,
}

pub fn automation_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/workflows", get(list_workflows))
        .route("/workflows/:name", get(get_workflow))
        .route("/workflows/:name/run", post(run_workflow))
        .route("/workflows/:name/logs", get(workflow_logs))
}

async fn list_workflows(State(state): State<Arc<AppState>>) -> Json<Vec<WorkflowStatusView>> {
    Json(state.scheduler.status())
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<WorkflowStatusView>> {
    state
        .scheduler
        .workflow_status(&name)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Workflow '{}'", name)))
}

async fn run_workflow(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<RunResponse>)> {
    let decision = state.scheduler.trigger_now(&name)?;

    let (status, label) = match decision {
        FireDecision::Fired => (StatusCode::ACCEPTED, "fired"),
        FireDecision::Skipped => (StatusCode::CONFLICT, "skipped"),
    };

    Ok((
        status,
        Json(RunResponse {
            workflow: name,
            status: label.to_string(),
        }),
    ))
}

async fn workflow_logs(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<LogQuery>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    if state.scheduler.workflow_status(&name).is_none() {
        return Err(AppError::NotFound(format!("Workflow '{}'", name)));
    }

    let limit = params.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let entries = state.ledger.recent(&name, limit).await?;
    Ok(Json(entries))
}
