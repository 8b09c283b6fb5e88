use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use conductor_core::completion::{AgentRole, Completion, CompletionGateway, CompletionRequest};
use conductor_core::errors::GatewayError;
use conductor_core::messages::ToolCall;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Reply(Completion),
    Error(GatewayError),
    /// Wait a duration, then produce the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Panic inside `complete`, for exercising task isolation.
    Panic(String),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Reply(Completion::text(text))
    }

    pub fn tool_call(name: &str, arguments: Value) -> Self {
        Self::Reply(Completion::tool_calls(vec![ToolCall::new(name, arguments)]))
    }

    pub fn tool_calls(calls: Vec<(&str, Value)>) -> Self {
        Self::Reply(Completion::tool_calls(
            calls
                .into_iter()
                .map(|(name, args)| ToolCall::new(name, args))
                .collect(),
        ))
    }

    /// A `make_plan` call assigning each `(agent, desc)` pair.
    pub fn plan(agents: u32, tasks: &[(u32, &str)]) -> Self {
        let tasks: Vec<Value> = tasks
            .iter()
            .map(|(agent, desc)| json!({"agent": agent, "desc": desc}))
            .collect();
        Self::tool_call("make_plan", json!({"agents": agents, "tasks": tasks}))
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

struct Script {
    role: AgentRole,
    needle: Option<String>,
    responses: VecDeque<MockResponse>,
}

impl Script {
    fn matches(&self, request: &CompletionRequest) -> bool {
        if self.role != request.role || self.responses.is_empty() {
            return false;
        }
        match &self.needle {
            Some(needle) => request.messages.iter().any(|m| m.text().contains(needle.as_str())),
            None => true,
        }
    }
}

/// Gateway returning scripted responses.
///
/// Responses are looked up per call: first a script whose role matches and whose
/// needle occurs in the conversation, then a role-only script, then the plain
/// sequence passed to [`MockGateway::new`]. Needles let concurrent workers get
/// their own responses regardless of scheduling order.
pub struct MockGateway {
    sequence: Mutex<VecDeque<MockResponse>>,
    scripts: Mutex<Vec<Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
    call_count: AtomicUsize,
}

impl MockGateway {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            sequence: Mutex::new(responses.into()),
            scripts: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn scripted() -> Self {
        Self::new(Vec::new())
    }

    /// Responses for every request made by `role`.
    pub fn on(self, role: AgentRole, responses: Vec<MockResponse>) -> Self {
        self.scripts.lock().push(Script {
            role,
            needle: None,
            responses: responses.into(),
        });
        self
    }

    /// Responses for requests by `role` whose messages contain `needle`.
    pub fn on_matching(self, role: AgentRole, needle: &str, responses: Vec<MockResponse>) -> Self {
        self.scripts.lock().push(Script {
            role,
            needle: Some(needle.to_string()),
            responses: responses.into(),
        });
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, role: AgentRole) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.role == role)
            .cloned()
            .collect()
    }

    fn next_response(&self, request: &CompletionRequest) -> Option<MockResponse> {
        {
            let mut scripts = self.scripts.lock();
            let specific = scripts
                .iter()
                .position(|s| s.needle.is_some() && s.matches(request));
            let index = specific.or_else(|| {
                scripts
                    .iter()
                    .position(|s| s.needle.is_none() && s.matches(request))
            });
            if let Some(i) = index {
                return scripts[i].responses.pop_front();
            }
        }
        self.sequence.lock().pop_front()
    }
}

#[async_trait]
impl CompletionGateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        let response = self.next_response(&request);
        self.requests.lock().push(request.clone());

        let Some(mut response) = response else {
            return Err(GatewayError::InvalidRequest(format!(
                "MockGateway: no response configured for {} call {idx}",
                request.role
            )));
        };

        loop {
            match response {
                MockResponse::Reply(completion) => return Ok(completion),
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    response = *inner;
                }
                MockResponse::Panic(message) => panic!("{message}"),
            }
        }
    }
}
