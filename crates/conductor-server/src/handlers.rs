//! RPC method handlers, shared with the HTTP routes.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use conductor_core::completion::{ModelSelection, ProviderKind};
use conductor_core::history::HistoryEntry;
use conductor_core::ids::RunId;
use conductor_engine::{RunRequest, Subscription, ToolRegistry};
use conductor_store::{Database, HistoryRepo, RunEventRepo, RunRepo};
use conductor_telemetry::{MetricsQuery, MetricsRecorder};

use crate::client::{ClientId, ClientRegistry};
use crate::error::ServerError;
use crate::event_bridge;
use crate::orchestrator::{RunManager, StartedRun};
use crate::rpc::{self, RpcResponse};

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub db: Database,
    pub runs: Arc<RunManager>,
    pub tools: Arc<ToolRegistry>,
    pub registry: Arc<ClientRegistry>,
    pub metrics: Option<Arc<MetricsRecorder>>,
    started_at: Instant,
}

impl HandlerState {
    pub fn new(db: Database, runs: Arc<RunManager>, tools: Arc<ToolRegistry>, registry: Arc<ClientRegistry>) -> Self {
        Self {
            db,
            runs,
            tools,
            registry,
            metrics: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Submit parameters. Accepts both camelCase and the form field names of the web client.
#[derive(Clone, Debug, Deserialize)]
pub struct ChatParams {
    pub prompt: String,
    #[serde(default, alias = "orchestratorProvider")]
    pub orc_provider: ProviderKind,
    #[serde(alias = "orchestratorModel")]
    pub orchestrator_model: String,
    #[serde(default, alias = "coderProvider")]
    pub coder_provider: ProviderKind,
    #[serde(alias = "coderModel")]
    pub coder_model: String,
    #[serde(default)]
    pub workers: Option<u32>,
    #[serde(default = "default_true", alias = "orchestratorEnabled")]
    pub orc_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ChatParams {
    pub fn from_value(params: &Value) -> Result<Self, ServerError> {
        serde_json::from_value(params.clone()).map_err(|e| ServerError::InvalidRequest(e.to_string()))
    }

    pub fn into_request(self) -> RunRequest {
        RunRequest {
            prompt: self.prompt,
            orchestrator: ModelSelection::new(self.orc_provider, self.orchestrator_model),
            coder: ModelSelection::new(self.coder_provider, self.coder_model),
            worker_hint: self.workers,
            orchestrator_enabled: self.orc_enabled,
        }
    }
}

/// Reply of a direct command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandReply {
    pub cmd: String,
    pub result: String,
}

/// Outcome of one RPC call.
pub struct Dispatched {
    pub response: RpcResponse,
    /// Run streams the call opened for the caller, forwarded once the response is queued.
    attachments: Vec<(RunId, Subscription)>,
}

impl Dispatched {
    /// Queue the response to `client_id`, then start forwarding the streams it opened,
    /// so the caller learns the run id before the run's first event.
    pub async fn deliver(self, registry: &Arc<ClientRegistry>, client_id: &ClientId) {
        if let Ok(json) = serde_json::to_string(&self.response) {
            registry.deliver(client_id, json).await;
        }
        for (run_id, subscription) in self.attachments {
            event_bridge::attach(registry, client_id, run_id, subscription);
        }
    }
}

/// Dispatch an RPC method. `client` is the calling WebSocket client, if any.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    client: Option<&ClientId>,
    method: &str,
    params: &Value,
    id: Option<Value>,
) -> Dispatched {
    let mut attachments = Vec::new();
    let result = match method {
        "health" => Ok(health(state)),
        "chat.submit" => chat_submit(state, client, params, &mut attachments),
        "run.subscribe" => run_subscribe(state, client, params, &mut attachments),
        "run.unsubscribe" => run_unsubscribe(state, client, params),
        "run.abort" => run_abort(state, params),
        "run.get" => run_id_param(params).and_then(|run_id| run_details(state, &run_id)),
        "history.list" => history_list(state, params),
        "command.execute" => command_execute(state, params).await,
        "metrics.get" => metrics_get(state, params),
        _ => {
            return Dispatched {
                response: RpcResponse::method_not_found(id, method),
                attachments,
            }
        }
    };

    let response = match result {
        Ok(value) => RpcResponse::success(id, value),
        Err(e) => {
            if matches!(e, ServerError::Store(_) | ServerError::Internal(_)) {
                tracing::error!(method, error = %e, "rpc handler failed");
            }
            RpcResponse::error(id, e.rpc_code(), e.to_string())
        }
    };
    Dispatched { response, attachments }
}

pub fn health(state: &HandlerState) -> Value {
    json!({
        "status": "healthy",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "activeRuns": state.runs.active_count(),
        "clients": state.registry.count(),
    })
}

/// Start a run from submit parameters.
pub fn submit(state: &HandlerState, params: &Value) -> Result<StartedRun, ServerError> {
    let request = ChatParams::from_value(params)?.into_request();
    state.runs.start(request)
}

fn chat_submit(
    state: &HandlerState,
    client: Option<&ClientId>,
    params: &Value,
    attachments: &mut Vec<(RunId, Subscription)>,
) -> Result<Value, ServerError> {
    let started = submit(state, params)?;
    let run_id = started.run_id.clone();
    let subscribed = client.is_some_and(|client_id| state.registry.get(client_id).is_some());
    if subscribed {
        attachments.push((run_id.clone(), started.subscription));
    }
    Ok(json!({ "runId": run_id, "subscribed": subscribed }))
}

fn run_id_param(params: &Value) -> Result<RunId, ServerError> {
    rpc::require_str(params, "runId")
        .map(RunId::from_raw)
        .map_err(ServerError::InvalidRequest)
}

fn require_client(client: Option<&ClientId>) -> Result<&ClientId, ServerError> {
    client.ok_or_else(|| ServerError::InvalidRequest("subscriptions need a WebSocket client".into()))
}

fn run_subscribe(
    state: &HandlerState,
    client: Option<&ClientId>,
    params: &Value,
    attachments: &mut Vec<(RunId, Subscription)>,
) -> Result<Value, ServerError> {
    require_client(client)?;
    let run_id = run_id_param(params)?;
    match state.runs.subscribe(&run_id) {
        Some(subscription) => {
            attachments.push((run_id.clone(), subscription));
            Ok(json!({ "runId": run_id, "live": true }))
        }
        None => {
            // Finished: the caller reads the stored events through run.get.
            RunRepo::new(state.db.clone())
                .get(&run_id)?
                .ok_or_else(|| ServerError::NotFound(format!("run {run_id}")))?;
            Ok(json!({ "runId": run_id, "live": false }))
        }
    }
}

fn run_unsubscribe(state: &HandlerState, client: Option<&ClientId>, params: &Value) -> Result<Value, ServerError> {
    let client_id = require_client(client)?;
    let run_id = run_id_param(params)?;
    let removed = state.registry.detach(client_id, &run_id);
    Ok(json!({ "runId": run_id, "removed": removed }))
}

fn run_abort(state: &HandlerState, params: &Value) -> Result<Value, ServerError> {
    let run_id = run_id_param(params)?;
    let aborted = state.runs.abort(&run_id);
    Ok(json!({ "runId": run_id, "aborted": aborted }))
}

/// Run row, stored events and, while it runs, the live state.
pub fn run_details(state: &HandlerState, run_id: &RunId) -> Result<Value, ServerError> {
    let row = RunRepo::new(state.db.clone())
        .get(run_id)?
        .ok_or_else(|| ServerError::NotFound(format!("run {run_id}")))?;
    let events = RunEventRepo::new(state.db.clone()).list(run_id)?;
    Ok(json!({
        "run": row,
        "events": events,
        "state": state.runs.state(run_id),
    }))
}

fn history_list(state: &HandlerState, params: &Value) -> Result<Value, ServerError> {
    let run_id = rpc::optional_str(params, "runId").map(RunId::from_raw);
    let entries = HistoryRepo::new(state.db.clone()).entries(run_id.as_ref())?;
    Ok(json!({ "entries": entries }))
}

/// Run a command outside any run and log it to the shared history.
pub async fn execute_command(state: &HandlerState, command: &str) -> Result<CommandReply, ServerError> {
    if command.trim().is_empty() {
        return Err(ServerError::InvalidRequest("command must not be empty".into()));
    }
    let output = state.tools.run_command(command, &CancellationToken::new()).await;
    tracing::info!(command, status = ?output.status, duration_ms = output.duration.as_millis() as u64, "direct command");

    let history = HistoryRepo::new(state.db.clone());
    history.insert(None, &HistoryEntry::tool_call("shell", &json!({ "command": command })))?;
    history.insert(None, &HistoryEntry::tool_call("shell_result", &json!({ "result": output.result })))?;

    Ok(CommandReply {
        cmd: command.to_string(),
        result: output.result,
    })
}

async fn command_execute(state: &HandlerState, params: &Value) -> Result<Value, ServerError> {
    let command = rpc::optional_str(params, "command")
        .or_else(|| rpc::optional_str(params, "cmd"))
        .ok_or_else(|| ServerError::InvalidRequest("Missing required parameter: command".into()))?;
    let reply = execute_command(state, command).await?;
    Ok(json!(reply))
}

/// `metrics.get` parameters. Without `persisted`, current in-process values are returned.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetricsParams {
    persisted: bool,
    name: Option<String>,
    since: Option<String>,
    limit: Option<u32>,
}

fn metrics_get(state: &HandlerState, params: &Value) -> Result<Value, ServerError> {
    let params: MetricsParams =
        serde_json::from_value(params.clone()).map_err(|e| ServerError::InvalidRequest(e.to_string()))?;
    let Some(metrics) = &state.metrics else {
        return Ok(json!({ "metrics": [] }));
    };
    if !params.persisted {
        return Ok(json!({ "metrics": metrics.current() }));
    }
    let query = MetricsQuery {
        name: params.name,
        since: params.since,
        limit: params.limit,
    };
    let rows = metrics
        .query(&query)
        .map_err(|e| ServerError::Internal(format!("metrics query: {e}")))?;
    Ok(json!({ "metrics": rows }))
}
