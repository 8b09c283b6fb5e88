//! Plain HTTP routes for clients that do not hold a WebSocket.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use conductor_core::ids::RunId;
use conductor_engine::RunReport;
use conductor_store::{HistoryRepo, RunRepo};

use crate::error::ServerError;
use crate::handlers;
use crate::server::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/runs", post(create_run))
        .route("/api/runs/{id}", get(get_run).delete(abort_run))
        .route("/api/history", get(history))
        .route("/api/command", post(command))
}

/// Submit and wait for the aggregate report.
async fn chat(State(state): State<AppState>, Json(body): Json<Value>) -> Result<Json<RunReport>, ServerError> {
    let started = handlers::submit(&state.handler_state, &body)?;
    let run_id = started.run_id.clone();
    drop(started.subscription);

    let secs = state.request_timeout.as_secs();
    match tokio::time::timeout(state.request_timeout, started.report).await {
        Ok(Ok(report)) => Ok(Json(report)),
        Ok(Err(_)) => Err(ServerError::Internal(format!("run {run_id} ended without a report"))),
        Err(_) => {
            tracing::warn!(run_id = %run_id, timeout_secs = secs, "chat request timed out, run continues");
            Err(ServerError::Timeout(secs))
        }
    }
}

/// Submit without waiting.
async fn create_run(State(state): State<AppState>, Json(body): Json<Value>) -> Result<impl IntoResponse, ServerError> {
    let started = handlers::submit(&state.handler_state, &body)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "runId": started.run_id }))))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ServerError> {
    handlers::run_details(&state.handler_state, &RunId::from_raw(id)).map(Json)
}

async fn abort_run(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ServerError> {
    let run_id = RunId::from_raw(id);
    let aborted = state.handler_state.runs.abort(&run_id);
    if !aborted && RunRepo::new(state.handler_state.db.clone()).get(&run_id)?.is_none() {
        return Err(ServerError::NotFound(format!("run {run_id}")));
    }
    Ok(Json(json!({ "runId": run_id, "aborted": aborted })))
}

async fn history(State(state): State<AppState>) -> Result<Json<Value>, ServerError> {
    let entries = HistoryRepo::new(state.handler_state.db.clone()).entries(None)?;
    Ok(Json(json!(entries)))
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    #[serde(alias = "cmd")]
    command: String,
}

async fn command(
    State(state): State<AppState>,
    Json(body): Json<CommandBody>,
) -> Result<Json<handlers::CommandReply>, ServerError> {
    handlers::execute_command(&state.handler_state, &body.command)
        .await
        .map(Json)
}
