use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use conductor_core::completion::{AgentRole, CompletionRequest, ModelSelection, ToolChoice};
use conductor_core::messages::ChatMessage;
use conductor_core::tools::ToolDefinition;

use crate::agent::AgentRuntime;

pub const ROUTE: &str = "route";

/// History entries the router sees, counted from the end.
pub const ROUTER_WINDOW: usize = 6;

const ROUTER_PROMPT: &str = "You are a routing assistant. Decide **only** whether the last user \
message should be handled directly by the lightweight coder model (`answer`) or forwarded to the \
orchestrator (`hand_off`). Return the decision by calling the `route` function and nothing else.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Answer,
    HandOff,
}

pub fn route_definition() -> ToolDefinition {
    ToolDefinition {
        name: ROUTE.into(),
        description: "Decide who handles the last user message.".into(),
        parameters_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["answer", "hand_off"]},
                "answer": {"type": "string"}
            },
            "required": ["action"]
        }),
    }
}

/// Ask the coder model whether to answer directly. Any failure means `HandOff`.
pub async fn route(
    runtime: &AgentRuntime,
    selection: &ModelSelection,
    conversation: &[ChatMessage],
    cancel: &CancellationToken,
) -> Route {
    let start = conversation.len().saturating_sub(ROUTER_WINDOW);
    let mut messages = vec![ChatMessage::system(ROUTER_PROMPT)];
    messages.extend_from_slice(&conversation[start..]);

    let request = CompletionRequest::new(AgentRole::Router, selection.clone(), messages)
        .with_tools(vec![route_definition()])
        .with_tool_choice(ToolChoice::Function(ROUTE.into()));

    let completion = match runtime.complete(request, cancel).await {
        Ok(completion) => completion,
        Err(e) => {
            warn!(error = %e, "router call failed, handing off");
            return Route::HandOff;
        }
    };

    let decision = completion
        .tool_calls
        .iter()
        .find(|call| call.name == ROUTE)
        .and_then(|call| call.str_arg("action"))
        .map(|action| match action {
            "answer" => Route::Answer,
            _ => Route::HandOff,
        })
        .unwrap_or(Route::HandOff);
    debug!(?decision, "router decided");
    decision
}
