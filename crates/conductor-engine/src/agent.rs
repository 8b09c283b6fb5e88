use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use conductor_core::completion::{AgentRole, Completion, CompletionGateway, CompletionRequest, ModelSelection};
use conductor_core::errors::GatewayError;
use conductor_core::history::{HistoryEntry, HistoryStore};
use conductor_core::ids::RunId;
use conductor_core::messages::{ChatMessage, ToolCall};
use conductor_core::tools::{ToolExecutor, ToolOutput, ToolRun, ToolStatus};

use crate::error::AgentError;

const BUDGET_EXHAUSTED: &str = "Tool budget exhausted. Reply with your final answer without calling tools.";

/// Collaborators and limits shared by every model-driven step of a run.
#[derive(Clone)]
pub struct AgentRuntime {
    pub gateway: Arc<dyn CompletionGateway>,
    pub tools: Arc<dyn ToolExecutor>,
    pub history: Arc<dyn HistoryStore>,
    pub max_tool_invocations: u32,
    pub gateway_timeout: Duration,
    pub tool_retries: u32,
}

/// One tool-using conversation: a worker, the coder, or the hand-off agent.
pub struct AgentSpec {
    pub run_id: RunId,
    pub role: AgentRole,
    pub selection: ModelSelection,
    pub messages: Vec<ChatMessage>,
}

impl AgentRuntime {
    /// A single gateway call, bounded by the gateway timeout and the cancellation token.
    pub async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, GatewayError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            result = tokio::time::timeout(self.gateway_timeout, self.gateway.complete(request)) => {
                result.map_err(|_| GatewayError::Timeout(self.gateway_timeout))?
            }
        }
    }

    /// Execute one tool call and log it to the conversation history.
    ///
    /// A call that times out is tried again up to `tool_retries` times, with backoff.
    pub async fn invoke_tool(&self, run_id: &RunId, call: &ToolCall, cancel: &CancellationToken) -> ToolOutput {
        self.record(run_id, HistoryEntry::tool_call(&call.name, &call.arguments));
        let mut attempt = 0u32;
        loop {
            let output = self.tools.execute(call, cancel).await;
            if output.status != ToolStatus::Timeout || attempt >= self.tool_retries || cancel.is_cancelled() {
                return output;
            }
            attempt += 1;
            let delay = Duration::from_millis(500u64.saturating_mul(2u64.saturating_pow(attempt - 1)))
                .min(Duration::from_secs(5));
            warn!(
                run_id = %run_id,
                tool = %call.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "tool call timed out, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return output,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Append to history. History is best-effort: failures are logged, never fatal.
    pub fn record(&self, run_id: &RunId, entry: HistoryEntry) {
        if let Err(e) = self.history.append(Some(run_id), entry) {
            warn!(run_id = %run_id, error = %e, "failed to append history");
        }
    }

    /// Drive the tool loop until the model answers in text.
    ///
    /// Every tool invocation is pushed to `runs` as soon as it finishes, so a
    /// caller that abandons this future still sees what already ran.
    pub async fn run_agent(
        &self,
        spec: AgentSpec,
        cancel: &CancellationToken,
        runs: &mut Vec<ToolRun>,
    ) -> Result<String, AgentError> {
        let AgentSpec {
            run_id,
            role,
            selection,
            mut messages,
        } = spec;
        let mut used = 0u32;
        let mut budget_notice_sent = false;

        loop {
            let budget_left = used < self.max_tool_invocations;
            if !budget_left && !budget_notice_sent {
                messages.push(ChatMessage::user(BUDGET_EXHAUSTED));
                budget_notice_sent = true;
            }

            let mut request = CompletionRequest::new(role, selection.clone(), messages.clone());
            if budget_left {
                request = request.with_tools(self.tools.definitions());
            }

            let completion = self.complete(request, cancel).await.map_err(|e| match e {
                GatewayError::Cancelled => AgentError::Cancelled,
                other => AgentError::Gateway(other),
            })?;

            if !completion.wants_tools() || !budget_left {
                return Ok(completion.text_or_empty().trim().to_string());
            }

            messages.push(completion.to_message());
            for call in &completion.tool_calls {
                if used >= self.max_tool_invocations {
                    messages.push(ChatMessage::tool_result(call.id.clone(), &call.name, BUDGET_EXHAUSTED));
                    continue;
                }
                used += 1;

                let output = self.invoke_tool(&run_id, call, cancel).await;
                if cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }
                debug!(run_id = %run_id, role = %role, tool = %call.name, used, "agent tool call finished");
                messages.push(ChatMessage::tool_result(call.id.clone(), &call.name, output.result.clone()));
                runs.push(output.into_run());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use conductor_core::history::{HistoryEntry, HistoryError, HistoryRecord, HistoryStore};
    use conductor_core::ids::RunId;
    use conductor_core::messages::ToolCall;
    use conductor_core::tools::{ToolDefinition, ToolExecutor, ToolOutput, ToolStatus};

    /// Tool executor answering from a script keyed by tool name; unknown tools echo their arguments.
    #[derive(Default)]
    pub struct ScriptedTools {
        replies: HashMap<String, String>,
        delay: Option<Duration>,
        statuses: Mutex<VecDeque<ToolStatus>>,
        pub calls: Mutex<Vec<ToolCall>>,
    }

    impl ScriptedTools {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(mut self, tool: &str, output: &str) -> Self {
            self.replies.insert(tool.to_string(), output.to_string());
            self
        }

        pub fn slow(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Statuses for successive calls; once used up, calls succeed.
        pub fn statuses(self, statuses: Vec<ToolStatus>) -> Self {
            *self.statuses.lock() = statuses.into();
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl ToolExecutor for ScriptedTools {
        fn definitions(&self) -> Vec<ToolDefinition> {
            ["read_file", "write_command"]
                .into_iter()
                .map(|name| ToolDefinition {
                    name: name.into(),
                    description: format!("{name} for tests"),
                    parameters_schema: serde_json::json!({"type": "object"}),
                })
                .collect()
        }

        async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolOutput {
            self.calls.lock().push(call.clone());
            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let command = call
                .str_arg("command")
                .map(str::to_string)
                .unwrap_or_else(|| call.name.clone());
            let result = self
                .replies
                .get(&call.name)
                .cloned()
                .unwrap_or_else(|| call.arguments.to_string());
            let status = self.statuses.lock().pop_front().unwrap_or(ToolStatus::Ok);
            ToolOutput {
                command,
                result,
                status,
                duration: Duration::ZERO,
            }
        }
    }

    #[derive(Default)]
    pub struct MemoryHistory {
        pub entries: Mutex<Vec<(Option<RunId>, HistoryEntry)>>,
    }

    impl HistoryStore for MemoryHistory {
        fn append(&self, run_id: Option<&RunId>, entry: HistoryEntry) -> Result<(), HistoryError> {
            self.entries.lock().push((run_id.cloned(), entry));
            Ok(())
        }

        fn list(&self, run_id: Option<&RunId>) -> Result<Vec<HistoryEntry>, HistoryError> {
            Ok(self
                .entries
                .lock()
                .iter()
                .filter(|(id, _)| run_id.is_none() || id.as_ref() == run_id)
                .map(|(_, e)| e.clone())
                .collect())
        }

        fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, HistoryError> {
            let entries = self.entries.lock();
            let skip = entries.len().saturating_sub(limit);
            Ok(entries
                .iter()
                .skip(skip)
                .map(|(run_id, entry)| HistoryRecord {
                    run_id: run_id.clone(),
                    entry: entry.clone(),
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{MemoryHistory, ScriptedTools};
    use super::*;
    use conductor_core::completion::ProviderKind;
    use conductor_llm::{MockGateway, MockResponse};
    use serde_json::json;

    fn runtime(gateway: MockGateway, tools: Arc<ScriptedTools>, max_tools: u32) -> (AgentRuntime, Arc<MockGateway>) {
        let gateway = Arc::new(gateway);
        let runtime = AgentRuntime {
            gateway: gateway.clone(),
            tools,
            history: Arc::new(MemoryHistory::default()),
            max_tool_invocations: max_tools,
            gateway_timeout: Duration::from_secs(60),
            tool_retries: 1,
        };
        (runtime, gateway)
    }

    fn spec() -> AgentSpec {
        AgentSpec {
            run_id: RunId::new(),
            role: AgentRole::Worker,
            selection: ModelSelection::new(ProviderKind::OpenAi, "gpt-4o-mini"),
            messages: vec![ChatMessage::system("You are coder agent 1.")],
        }
    }

    #[tokio::test]
    async fn tool_loop_records_runs_in_order() {
        let tools = Arc::new(ScriptedTools::new().reply("read_file", "fn main() {}"));
        let (runtime, gateway) = runtime(
            MockGateway::new(vec![
                MockResponse::tool_call("write_command", json!({"command": "ls"})),
                MockResponse::tool_call("read_file", json!({"filename": "main.rs"})),
                MockResponse::text("  all good  "),
            ]),
            tools,
            16,
        );

        let mut runs = Vec::new();
        let reply = runtime
            .run_agent(spec(), &CancellationToken::new(), &mut runs)
            .await
            .unwrap();

        assert_eq!(reply, "all good");
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].command, "ls");
        assert_eq!(runs[1].command, "read_file");
        assert_eq!(runs[1].result, "fn main() {}");

        let last = gateway.requests().pop().unwrap();
        assert!(matches!(last.messages.last(), Some(ChatMessage::Tool { .. })));
        assert_eq!(last.tools.len(), 2);
    }

    #[tokio::test]
    async fn budget_exhaustion_asks_once_without_tools() {
        let tools = Arc::new(ScriptedTools::new());
        let (runtime, gateway) = runtime(
            MockGateway::new(vec![
                MockResponse::tool_calls(vec![
                    ("write_command", json!({"command": "a"})),
                    ("write_command", json!({"command": "b"})),
                    ("write_command", json!({"command": "c"})),
                ]),
                MockResponse::text("stopped early"),
            ]),
            Arc::clone(&tools),
            2,
        );

        let mut runs = Vec::new();
        let reply = runtime
            .run_agent(spec(), &CancellationToken::new(), &mut runs)
            .await
            .unwrap();

        assert_eq!(reply, "stopped early");
        assert_eq!(runs.len(), 2);
        assert_eq!(tools.call_count(), 2);
        let last = gateway.requests().pop().unwrap();
        assert!(last.tools.is_empty());
        assert_eq!(last.messages.last().unwrap().text(), BUDGET_EXHAUSTED);
    }

    #[tokio::test]
    async fn tool_calls_are_logged_to_history() {
        let history = Arc::new(MemoryHistory::default());
        let gateway = Arc::new(MockGateway::new(vec![
            MockResponse::tool_call("write_command", json!({"command": "ls"})),
            MockResponse::text("done"),
        ]));
        let runtime = AgentRuntime {
            gateway,
            tools: Arc::new(ScriptedTools::new()),
            history: history.clone(),
            max_tool_invocations: 4,
            gateway_timeout: Duration::from_secs(60),
            tool_retries: 1,
        };
        let mut runs = Vec::new();
        runtime
            .run_agent(spec(), &CancellationToken::new(), &mut runs)
            .await
            .unwrap();

        let entries = history.list(None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, r#"[tool_call] write_command {"command":"ls"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_tool_is_retried() {
        let tools = Arc::new(
            ScriptedTools::new()
                .reply("write_command", "built")
                .statuses(vec![ToolStatus::Timeout, ToolStatus::Ok]),
        );
        let (runtime, _) = runtime(
            MockGateway::new(vec![
                MockResponse::tool_call("write_command", json!({"command": "make"})),
                MockResponse::text("built it"),
            ]),
            Arc::clone(&tools),
            4,
        );

        let mut runs = Vec::new();
        let reply = runtime
            .run_agent(spec(), &CancellationToken::new(), &mut runs)
            .await
            .unwrap();

        assert_eq!(reply, "built it");
        assert_eq!(tools.call_count(), 2);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, ToolStatus::Ok);
        assert_eq!(runs[0].result, "built");
    }

    #[tokio::test(start_paused = true)]
    async fn tool_retries_are_bounded() {
        let tools = Arc::new(ScriptedTools::new().statuses(vec![ToolStatus::Timeout; 3]));
        let (runtime, _) = runtime(
            MockGateway::new(vec![
                MockResponse::tool_call("write_command", json!({"command": "sleep 100"})),
                MockResponse::text("gave up"),
            ]),
            Arc::clone(&tools),
            4,
        );

        let mut runs = Vec::new();
        runtime
            .run_agent(spec(), &CancellationToken::new(), &mut runs)
            .await
            .unwrap();

        assert_eq!(tools.call_count(), 2);
        assert_eq!(runs[0].status, ToolStatus::Timeout);
    }

    #[tokio::test]
    async fn failed_tool_is_not_retried() {
        let tools = Arc::new(ScriptedTools::new().statuses(vec![ToolStatus::Error]));
        let (runtime, _) = runtime(
            MockGateway::new(vec![
                MockResponse::tool_call("write_command", json!({"command": "false"})),
                MockResponse::text("it failed"),
            ]),
            Arc::clone(&tools),
            4,
        );

        let mut runs = Vec::new();
        runtime
            .run_agent(spec(), &CancellationToken::new(), &mut runs)
            .await
            .unwrap();

        assert_eq!(tools.call_count(), 1);
        assert_eq!(runs[0].status, ToolStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_slow_tool() {
        let tools = Arc::new(ScriptedTools::new().slow(Duration::from_secs(600)));
        let (runtime, _) = runtime(
            MockGateway::new(vec![
                MockResponse::tool_call("write_command", json!({"command": "cargo build"})),
                MockResponse::text("unreachable"),
            ]),
            Arc::clone(&tools),
            4,
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let mut runs = Vec::new();
        let err = runtime.run_agent(spec(), &cancel, &mut runs).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(tools.call_count(), 1);
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn gateway_error_surfaces() {
        let (runtime, _) = runtime(
            MockGateway::new(vec![MockResponse::Error(GatewayError::AuthenticationFailed("bad".into()))]),
            Arc::new(ScriptedTools::new()),
            4,
        );
        let mut runs = Vec::new();
        let err = runtime
            .run_agent(spec(), &CancellationToken::new(), &mut runs)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Gateway(GatewayError::AuthenticationFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_gateway_call() {
        let (runtime, _) = runtime(
            MockGateway::new(vec![MockResponse::delayed(Duration::from_secs(600), MockResponse::text("late"))]),
            Arc::new(ScriptedTools::new()),
            4,
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let mut runs = Vec::new();
        let err = runtime.run_agent(spec(), &cancel, &mut runs).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_gateway_times_out() {
        let (mut runtime, _) = runtime(
            MockGateway::new(vec![MockResponse::delayed(Duration::from_secs(600), MockResponse::text("late"))]),
            Arc::new(ScriptedTools::new()),
            4,
        );
        runtime.gateway_timeout = Duration::from_secs(5);
        let err = runtime
            .complete(spec_request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(d) if d == Duration::from_secs(5)));
    }

    fn spec_request() -> CompletionRequest {
        let spec = spec();
        CompletionRequest::new(spec.role, spec.selection, spec.messages)
    }
}
