use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use conductor_engine::{Conductor, ToolRegistry};
use conductor_store::Database;
use conductor_telemetry::MetricsRecorder;

use crate::client::{self, ClientId, ClientRegistry};
use crate::handlers::{self, HandlerState};
use crate::http;
use crate::orchestrator::RunManager;
use crate::rpc::{RpcRequest, RpcResponse};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9091,
            max_send_queue: 256,
            request_timeout_secs: 300,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
    pub request_timeout: Duration,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(http::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps it alive.
pub async fn start(
    config: ServerConfig,
    db: Database,
    conductor: Arc<Conductor>,
    tools: Arc<ToolRegistry>,
    metrics: Option<Arc<MetricsRecorder>>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue));
    let mut runs = RunManager::new(conductor, db.clone());
    if let Some(metrics) = &metrics {
        runs = runs.with_metrics(Arc::clone(metrics));
    }
    let runs = Arc::new(runs);

    let cleanup = client::start_cleanup_task(Arc::clone(&client_registry), Duration::from_secs(60));

    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);

    let mut handler_state = HandlerState::new(db, Arc::clone(&runs), tools, Arc::clone(&client_registry));
    if let Some(metrics) = metrics {
        handler_state = handler_state.with_metrics(metrics);
    }
    let handler_state = Arc::new(handler_state);

    let app_state = AppState {
        handler_state: Arc::clone(&handler_state),
        client_registry: Arc::clone(&client_registry),
        message_tx: msg_tx,
        request_timeout: Duration::from_secs(config.request_timeout_secs),
    };

    let rpc_handle = tokio::spawn(process_rpc_messages(msg_rx, handler_state, Arc::clone(&client_registry)));

    let router = build_router(app_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "conductor server started");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        runs,
        server: server_handle,
        rpc: rpc_handle,
        cleanup,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    runs: Arc<RunManager>,
    server: tokio::task::JoinHandle<()>,
    rpc: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Cancel every active run and stop serving. Returns how many runs were signalled.
    pub fn shutdown(&self) -> usize {
        let aborted = self.runs.abort_all();
        self.server.abort();
        self.rpc.abort();
        self.cleanup.abort();
        aborted
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.client_registry.register();
    tracing::info!(client_id = %client_id, "WebSocket client connected");

    client::handle_ws_connection(socket, client_id, rx, state.client_registry, state.message_tx).await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(handlers::health(&state.handler_state))
}

/// Process incoming RPC messages from WebSocket clients.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
) {
    while let Some((client_id, raw_message)) = rx.recv().await {
        let request: RpcRequest = match serde_json::from_str(&raw_message) {
            Ok(req) => req,
            Err(_) => {
                if let Ok(json) = serde_json::to_string(&RpcResponse::parse_error()) {
                    registry.send_to(&client_id, json);
                }
                continue;
            }
        };

        let state = Arc::clone(&state);
        let registry = Arc::clone(&registry);
        // command.execute can block for the full tool timeout.
        tokio::spawn(async move {
            let params = request.params.unwrap_or_else(|| serde_json::json!({}));
            tracing::debug!(client_id = %client_id, method = %request.method, "rpc request");
            handlers::dispatch(&state, Some(&client_id), &request.method, &params, request.id)
                .await
                .deliver(&registry, &client_id)
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::conductor;
    use conductor_core::completion::AgentRole;
    use conductor_engine::EngineConfig;
    use conductor_llm::{MockGateway, MockResponse};
    use serde_json::{json, Value};

    async fn serve(gateway: MockGateway) -> ServerHandle {
        let db = Database::in_memory().unwrap();
        let conductor = conductor(gateway, &db);
        let tools = Arc::new(ToolRegistry::with_builtins(&std::env::temp_dir(), &EngineConfig::default()));
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        start(config, db, conductor, tools, None).await.unwrap()
    }

    fn url(handle: &ServerHandle, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", handle.port)
    }

    fn chat_body(prompt: &str) -> Value {
        json!({
            "prompt": prompt,
            "orc_provider": "openai",
            "orchestrator_model": "gpt-4o",
            "coder_provider": "openai",
            "coder_model": "gpt-4o-mini",
            "orc_enabled": false,
        })
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = serve(MockGateway::scripted()).await;
        assert!(handle.port > 0);

        let resp = reqwest::get(url(&handle, "/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn chat_returns_aggregate_report() {
        let gateway = MockGateway::scripted().on(AgentRole::Coder, vec![MockResponse::text("all done")]);
        let handle = serve(gateway).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(url(&handle, "/api/chat"))
            .json(&chat_body("do it"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let report: Value = resp.json().await.unwrap();
        assert_eq!(report["coder"]["reply"], "all done");
        assert!(report["plans"].as_array().unwrap().is_empty());
        assert!(report["orchestrator"].is_null());

        let run_id = report["runId"].as_str().unwrap();
        let run: Value = client
            .get(url(&handle, &format!("/api/runs/{run_id}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(run["run"]["prompt"], "do it");
        assert_eq!(run["events"][0]["type"], "coder_done");

        let history: Value = reqwest::get(url(&handle, "/api/history")).await.unwrap().json().await.unwrap();
        assert_eq!(history[0]["content"], "do it");
    }

    #[tokio::test]
    async fn bad_submit_is_rejected() {
        let handle = serve(MockGateway::scripted()).await;
        let resp = reqwest::Client::new()
            .post(url(&handle, "/api/runs"))
            .json(&json!({ "prompt": "no models" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn detached_submit_then_abort_unknown() {
        let gateway = MockGateway::scripted().on(AgentRole::Coder, vec![MockResponse::text("later")]);
        let handle = serve(gateway).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(url(&handle, "/api/runs"))
            .json(&chat_body("background"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let body: Value = resp.json().await.unwrap();
        assert!(body["runId"].as_str().unwrap().starts_with("run_"));

        let resp = client.delete(url(&handle, "/api/runs/run_nope")).send().await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn command_endpoint() {
        let handle = serve(MockGateway::scripted()).await;
        let body: Value = reqwest::Client::new()
            .post(url(&handle, "/api/command"))
            .json(&json!({ "command": "echo hi" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["cmd"], "echo hi");
        assert_eq!(body["result"].as_str().unwrap().trim(), "hi");
    }
}
