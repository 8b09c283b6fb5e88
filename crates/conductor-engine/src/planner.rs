use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use conductor_core::completion::{AgentRole, CompletionRequest, ModelSelection};
use conductor_core::errors::GatewayError;
use conductor_core::events::EventPayload;
use conductor_core::history::HistoryEntry;
use conductor_core::messages::{ChatMessage, ToolCall};
use conductor_core::plan::PlanDraft;
use conductor_core::tools::{ToolDefinition, ToolRun};

use crate::agent::AgentRuntime;
use crate::error::EngineError;
use crate::stream::EventStream;

pub const MAKE_PLAN: &str = "make_plan";

const BUDGET_EXHAUSTED: &str =
    "Tool budget exhausted. Respond with a plan via make_plan or with your final report.";

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").unwrap());

/// What the planner decided for the current round.
#[derive(Debug)]
pub enum PlanOutcome {
    /// A plan to validate and dispatch.
    Plan(PlanDraft),
    /// No more rounds. The reply may be empty.
    Done(String),
    /// The model produced something plan-shaped that does not decode.
    Malformed(String),
    Error(GatewayError),
}

/// Messages and orchestrator tool runs accumulated over a run.
#[derive(Debug, Default)]
pub struct PlannerContext {
    pub messages: Vec<ChatMessage>,
    pub tool_runs: Vec<ToolRun>,
}

/// System prompt for the planning model.
pub fn system_prompt(cap: u32) -> String {
    format!(
        "You are a code super agent and have the ability to orchestrate multiple smaller agents. \
Your overall job is to guide the process and assign very specific tasks to smaller agents. \
You can assign tasks to individual agents or execute commands on your own; the smaller agents can run \
the same tools for writing, reading and changing files. \
Before creating smaller agents, create a detailed plan for everything that needs to be done. \
Right now you can have up to {cap} workers for 1 iteration. \
A new agent has no memory of previous tasks, so give it a detailed prompt listing what it needs to do. \
Agents work in parallel and independently, and must not work on the same file. \
You can run more iterations after one is complete: if the work needs more steps than available workers, \
or must happen in sequence, create more agents after you get feedback from the previous ones.\n\n\
When assigning tasks do not rely on one agent continuing the work of another unless you explicitly \
provide the previous results. Plan by calling make_plan, or respond ONLY with JSON like: \
{{\"agents\":N,\"tasks\":[{{\"agent\":1,\"desc\":\"task\"}}]}}\n\
When an iteration is over, you have the results from all agents and the process is complete, \
report to the user with a summary of what has been done."
    )
}

pub fn make_plan_definition() -> ToolDefinition {
    ToolDefinition {
        name: MAKE_PLAN.into(),
        description: "Return a plan for the requested tasks.".into(),
        parameters_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "agents": {"type": "integer"},
                "tasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "agent": {"type": "integer"},
                            "desc": {"type": "string"}
                        },
                        "required": ["agent", "desc"]
                    }
                }
            },
            "required": ["agents", "tasks"]
        }),
    }
}

fn decode_draft(value: Value) -> PlanOutcome {
    match serde_json::from_value::<PlanDraft>(value) {
        Ok(draft) if draft.is_empty() => PlanOutcome::Done(String::new()),
        Ok(draft) => PlanOutcome::Plan(draft),
        Err(e) => PlanOutcome::Malformed(e.to_string()),
    }
}

/// Classify a `make_plan` call's arguments.
pub fn parse_plan_call(call: &ToolCall) -> PlanOutcome {
    match &call.arguments {
        Value::String(raw) => PlanOutcome::Malformed(format!("make_plan arguments are not JSON: {raw}")),
        other => decode_draft(other.clone()),
    }
}

/// Classify a plain-text planner reply: a bare or fenced JSON plan, or prose.
pub fn parse_plan_text(text: &str) -> PlanOutcome {
    let trimmed = text.trim();
    let candidate = FENCED_JSON
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    if !(candidate.starts_with('{') && candidate.ends_with('}')) {
        return PlanOutcome::Done(trimmed.to_string());
    }

    let looks_like_plan = candidate.contains("\"agents\"") || candidate.contains("\"tasks\"");
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) if map.contains_key("agents") || map.contains_key("tasks") => {
            decode_draft(Value::Object(map))
        }
        Ok(_) => PlanOutcome::Done(trimmed.to_string()),
        Err(e) if looks_like_plan => PlanOutcome::Malformed(e.to_string()),
        Err(_) => PlanOutcome::Done(trimmed.to_string()),
    }
}

/// Produces one plan per round. May run tools itself before deciding.
pub struct RoundPlanner {
    runtime: AgentRuntime,
    selection: ModelSelection,
}

impl RoundPlanner {
    pub fn new(runtime: AgentRuntime, selection: ModelSelection) -> Self {
        Self { runtime, selection }
    }

    fn tools(&self, budget_left: bool) -> Vec<ToolDefinition> {
        let mut tools = if budget_left {
            self.runtime.tools.definitions()
        } else {
            Vec::new()
        };
        tools.push(make_plan_definition());
        tools
    }

    /// Ask the planning model for the next step.
    ///
    /// Tool calls other than `make_plan` are executed, recorded in
    /// `ctx.tool_runs` and published as `OrchestratorTool` events. The call
    /// returns once the model plans or answers in text.
    #[instrument(skip_all, fields(run_id = %stream.run_id(), round = round))]
    pub async fn plan(
        &self,
        ctx: &mut PlannerContext,
        round: u32,
        stream: &EventStream,
        cancel: &CancellationToken,
    ) -> Result<PlanOutcome, EngineError> {
        let run_id = stream.run_id().clone();
        let mut used = 0u32;
        let mut budget_notice_sent = false;

        loop {
            let budget_left = used < self.runtime.max_tool_invocations;
            if !budget_left && !budget_notice_sent {
                ctx.messages.push(ChatMessage::user(BUDGET_EXHAUSTED));
                budget_notice_sent = true;
            }

            let request = CompletionRequest::new(AgentRole::Planner, self.selection.clone(), ctx.messages.clone())
                .with_tools(self.tools(budget_left));
            let completion = match self.runtime.complete(request, cancel).await {
                Ok(completion) => completion,
                Err(e) => return Ok(PlanOutcome::Error(e)),
            };

            if !completion.wants_tools() {
                let text = completion.text_or_empty();
                ctx.messages.push(ChatMessage::assistant_text(text));
                let outcome = parse_plan_text(text);
                debug!(outcome = ?outcome_kind(&outcome), "planner answered in text");
                return Ok(outcome);
            }

            ctx.messages.push(completion.to_message());
            let mut plan_call: Option<&ToolCall> = None;
            for call in &completion.tool_calls {
                if call.name == MAKE_PLAN {
                    if plan_call.is_none() {
                        plan_call = Some(call);
                    } else {
                        ctx.messages.push(ChatMessage::tool_result(
                            call.id.clone(),
                            MAKE_PLAN,
                            "Ignored: only one plan per round.",
                        ));
                    }
                    continue;
                }

                if used >= self.runtime.max_tool_invocations {
                    ctx.messages.push(ChatMessage::tool_result(call.id.clone(), &call.name, BUDGET_EXHAUSTED));
                    continue;
                }
                used += 1;

                let output = self.runtime.invoke_tool(&run_id, call, cancel).await;
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                ctx.messages.push(ChatMessage::tool_result(call.id.clone(), &call.name, output.result.clone()));
                let run = output.into_run();
                let index = ctx.tool_runs.len() as u32;
                ctx.tool_runs.push(run.clone());
                stream
                    .publish(EventPayload::OrchestratorTool { round, index, run })
                    .map_err(|_| EngineError::StreamClosed)?;
            }

            if let Some(call) = plan_call {
                self.runtime.record(&run_id, HistoryEntry::tool_call(MAKE_PLAN, &call.arguments));
                let plan_text = match &call.arguments {
                    Value::String(raw) => raw.clone(),
                    other => other.to_string(),
                };
                ctx.messages.push(ChatMessage::tool_result(call.id.clone(), MAKE_PLAN, plan_text));
                let outcome = parse_plan_call(call);
                info!(outcome = ?outcome_kind(&outcome), "planner called make_plan");
                return Ok(outcome);
            }

            if !budget_left {
                return Ok(PlanOutcome::Malformed(format!(
                    "planner kept calling tools after its budget of {} invocations",
                    self.runtime.max_tool_invocations
                )));
            }
        }
    }
}

fn outcome_kind(outcome: &PlanOutcome) -> &'static str {
    match outcome {
        PlanOutcome::Plan(_) => "plan",
        PlanOutcome::Done(_) => "done",
        PlanOutcome::Malformed(_) => "malformed",
        PlanOutcome::Error(_) => "error",
    }
}
