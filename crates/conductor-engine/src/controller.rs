use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use conductor_core::completion::{AgentRole, CompletionGateway, CompletionRequest, ModelSelection};
use conductor_core::errors::PlanValidationError;
use conductor_core::events::EventPayload;
use conductor_core::history::{HistoryEntry, HistoryRole, HistoryStore};
use conductor_core::ids::RunId;
use conductor_core::messages::ChatMessage;
use conductor_core::plan::{AgentResult, Plan, PlanDraft};
use conductor_core::tools::{ToolExecutor, ToolRun};
use conductor_telemetry::MetricsRecorder;

use crate::agent::{AgentRuntime, AgentSpec};
use crate::config::EngineConfig;
use crate::error::{AgentError, EngineError};
use crate::planner::{self, PlanOutcome, PlannerContext, RoundPlanner};
use crate::pool::WorkerPool;
use crate::router::{self, Route};
use crate::stream::{EventStream, Subscription};

const CODER_PROMPT: &str = "You are a helpful coding assistant.";

const SUMMARY_REQUEST: &str = "The work is over. Report to the user with a summary of what has been done.";

/// A user request, as submitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub prompt: String,
    pub orchestrator: ModelSelection,
    pub coder: ModelSelection,
    #[serde(default)]
    pub worker_hint: Option<u32>,
    #[serde(default = "default_true")]
    pub orchestrator_enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Lifecycle of a run, observable through [`RunController::state`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Routing,
    /// A single agent answers without planning.
    Answering,
    Planning { round: u32 },
    Dispatching { round: u32 },
    Awaiting { round: u32, pending: usize },
    Summarizing,
    Completed,
    Failed { reason: String },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    pub reply: String,
    pub tool_runs: Vec<ToolRun>,
}

/// Aggregate outcome of a run: the non-streaming response shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: RunId,
    pub plans: Vec<Plan>,
    pub coder: Option<AgentReply>,
    pub orchestrator: Option<AgentReply>,
    pub agents: Vec<AgentResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            plans: Vec::new(),
            coder: None,
            orchestrator: None,
            agents: Vec::new(),
            error: None,
        }
    }
}

/// Shared engine: owns the worker pool and hands out one controller per run.
pub struct Conductor {
    config: EngineConfig,
    runtime: AgentRuntime,
    pool: WorkerPool,
    active: Arc<Mutex<HashSet<RunId>>>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Conductor {
    pub fn new(
        config: EngineConfig,
        gateway: Arc<dyn CompletionGateway>,
        tools: Arc<dyn ToolExecutor>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let runtime = AgentRuntime {
            gateway,
            tools,
            history,
            max_tool_invocations: config.max_tool_invocations,
            gateway_timeout: config.gateway_timeout,
            tool_retries: config.tool_retries,
        };
        let pool = WorkerPool::new(runtime.clone(), config.max_workers, config.worker_timeout);
        Self {
            config,
            runtime,
            pool,
            active: Arc::new(Mutex::new(HashSet::new())),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.pool = self.pool.with_metrics(Arc::clone(&metrics));
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.runtime.history
    }

    pub fn tools(&self) -> &Arc<dyn ToolExecutor> {
        &self.runtime.tools
    }

    /// Runs created and not yet dropped.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Prepare a run. Nothing happens until [`RunController::run`] or [`RunController::spawn`],
    /// so callers can subscribe first.
    pub fn create_run(&self, request: RunRequest) -> RunController {
        let run_id = RunId::new();
        let mut stream = EventStream::new(run_id.clone());
        if let Some(metrics) = &self.metrics {
            stream = stream.with_metrics(Arc::clone(metrics));
        }
        let (state_tx, _) = watch::channel(RunState::Idle);
        self.active.lock().insert(run_id.clone());
        RunController {
            active: ActiveRun {
                runs: Arc::clone(&self.active),
                run_id: run_id.clone(),
            },
            run_id,
            request,
            config: self.config.clone(),
            runtime: self.runtime.clone(),
            pool: self.pool.clone(),
            stream: Arc::new(stream),
            state_tx,
            cancel: CancellationToken::new(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Drives one run from request to terminal event.
pub struct RunController {
    run_id: RunId,
    request: RunRequest,
    config: EngineConfig,
    runtime: AgentRuntime,
    pool: WorkerPool,
    stream: Arc<EventStream>,
    state_tx: watch::Sender<RunState>,
    cancel: CancellationToken,
    metrics: Option<Arc<MetricsRecorder>>,
    active: ActiveRun,
}

/// Membership of a run in the active set, released when the controller is dropped.
struct ActiveRun {
    runs: Arc<Mutex<HashSet<RunId>>>,
    run_id: RunId,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.runs.lock().remove(&self.run_id);
    }
}

impl RunController {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn stream(&self) -> Arc<EventStream> {
        Arc::clone(&self.stream)
    }

    pub fn subscribe(&self) -> Subscription {
        self.stream.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run on a background task.
    pub fn spawn(self) -> RunHandle {
        let run_id = self.run_id.clone();
        let stream = self.stream();
        let state = self.state();
        let cancel = self.cancel_token();
        RunHandle {
            run_id,
            stream,
            state,
            cancel,
            join: Some(tokio::spawn(self.run())),
        }
    }

    /// Drive the run to completion. Always ends with exactly one terminal event and a closed stream.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub async fn run(self) -> RunReport {
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("runs.started", &[], 1);
        }
        info!(
            orchestrator_enabled = self.request.orchestrator_enabled,
            worker_hint = ?self.request.worker_hint,
            "run started"
        );

        let mut report = RunReport::new(self.run_id.clone());
        self.runtime
            .record(&self.run_id, HistoryEntry::user(self.request.prompt.clone()));

        let status = match self.drive(&mut report).await {
            Ok(terminal) => match self.stream.publish(terminal) {
                Ok(_) => {
                    self.set_state(RunState::Completed);
                    "completed"
                }
                Err(_) => {
                    let reason = EngineError::StreamClosed.to_string();
                    report.error = Some(reason.clone());
                    self.set_state(RunState::Failed { reason });
                    "failed"
                }
            },
            Err(e) => {
                let reason = e.to_string();
                error!(error = %reason, kind = e.error_kind(), "run failed");
                if let Err(closed) = self.stream.publish(EventPayload::RunError {
                    reason: reason.clone(),
                    kind: e.error_kind().to_string(),
                }) {
                    debug!(error = %closed, "terminal error not published");
                }
                report.error = Some(reason.clone());
                self.set_state(RunState::Failed { reason });
                "failed"
            }
        };

        self.stream.close();
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("runs.completed", &[("status", status)], 1);
        }
        info!(status, last_seq = self.stream.last_seq(), "run finished");
        report
    }

    fn set_state(&self, state: RunState) {
        debug!(?state, "run state");
        self.state_tx.send_replace(state);
    }

    fn publish(&self, payload: EventPayload) -> Result<(), EngineError> {
        self.stream
            .publish(payload)
            .map(|_| ())
            .map_err(|_| EngineError::StreamClosed)
    }

    fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Context for this run: a window of earlier records, minus those of runs still in flight,
    /// followed by everything this run has recorded.
    fn conversation(&self) -> Vec<ChatMessage> {
        let records = self
            .runtime
            .history
            .recent(self.config.history_window)
            .and_then(|earlier| Ok((earlier, self.runtime.history.list(Some(&self.run_id))?)));
        let (earlier, own) = match records {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "history unavailable, using the prompt alone");
                return vec![ChatMessage::user(self.request.prompt.clone())];
            }
        };

        let mut messages: Vec<ChatMessage> = {
            let active = self.active.runs.lock();
            earlier
                .into_iter()
                .filter(|record| record.run_id.as_ref().map_or(true, |id| !active.contains(id)))
                .map(|record| history_message(record.entry))
                .collect()
        };
        messages.extend(own.into_iter().map(history_message));
        if messages.is_empty() {
            messages.push(ChatMessage::user(self.request.prompt.clone()));
        }
        messages
    }

    async fn drive(&self, report: &mut RunReport) -> Result<EventPayload, EngineError> {
        let conversation = self.conversation();

        let decision = if self.config.routing_enabled {
            self.set_state(RunState::Routing);
            router::route(&self.runtime, &self.request.coder, &conversation, &self.cancel).await
        } else {
            Route::HandOff
        };
        self.check_cancelled()?;

        match (decision, self.request.orchestrator_enabled) {
            (Route::Answer, _) => {
                let reply = self.answer_directly(&self.request.coder, conversation).await?;
                report.coder = Some(reply.clone());
                Ok(EventPayload::CoderDone {
                    reply: reply.reply,
                    tool_runs: reply.tool_runs,
                })
            }
            (Route::HandOff, false) if self.config.routing_enabled => {
                let reply = self.answer_directly(&self.request.orchestrator, conversation).await?;
                report.orchestrator = Some(reply.clone());
                Ok(EventPayload::OrchestratorDone {
                    reply: reply.reply,
                    tool_runs: reply.tool_runs,
                })
            }
            (Route::HandOff, false) => {
                let reply = self.answer_directly(&self.request.coder, conversation).await?;
                report.coder = Some(reply.clone());
                Ok(EventPayload::CoderDone {
                    reply: reply.reply,
                    tool_runs: reply.tool_runs,
                })
            }
            (Route::HandOff, true) => self.orchestrate(conversation, report).await,
        }
    }

    /// One tool-using agent answers the whole conversation.
    async fn answer_directly(
        &self,
        selection: &ModelSelection,
        conversation: Vec<ChatMessage>,
    ) -> Result<AgentReply, EngineError> {
        self.set_state(RunState::Answering);
        let mut messages = vec![ChatMessage::system(CODER_PROMPT)];
        messages.extend(conversation);
        let spec = AgentSpec {
            run_id: self.run_id.clone(),
            role: AgentRole::Coder,
            selection: selection.clone(),
            messages,
        };

        let mut tool_runs = Vec::new();
        let outcome = tokio::time::timeout(
            self.config.worker_timeout,
            self.runtime.run_agent(spec, &self.cancel, &mut tool_runs),
        )
        .await;
        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(AgentError::Cancelled)) => return Err(EngineError::Cancelled),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(AgentError::Timeout(self.config.worker_timeout).into()),
        };

        self.runtime.record(&self.run_id, HistoryEntry::assistant(reply.clone()));
        Ok(AgentReply { reply, tool_runs })
    }

    async fn orchestrate(
        &self,
        conversation: Vec<ChatMessage>,
        report: &mut RunReport,
    ) -> Result<EventPayload, EngineError> {
        let cap = self.config.effective_cap(self.request.worker_hint);
        let planner = RoundPlanner::new(self.runtime.clone(), self.request.orchestrator.clone());
        let mut ctx = PlannerContext {
            messages: vec![ChatMessage::system(planner::system_prompt(cap))],
            tool_runs: Vec::new(),
        };
        ctx.messages.extend(conversation);

        let mut finished: Option<String> = None;
        for round in 1..=self.config.max_rounds {
            self.set_state(RunState::Planning { round });
            let draft = match self.plan_with_retries(&planner, &mut ctx, round).await? {
                PlanOutcome::Plan(draft) => draft,
                PlanOutcome::Done(reply) => {
                    finished = Some(reply);
                    break;
                }
                PlanOutcome::Malformed(reason) => {
                    return Err(PlanValidationError::Malformed(reason).into());
                }
                PlanOutcome::Error(e) => return Err(e.into()),
            };

            let plan = draft.validate(round, cap)?;
            self.publish(EventPayload::PlanReady { plan: plan.clone() })?;
            report.plans.push(plan.clone());

            let results = self.dispatch(&plan).await?;
            if let Some(metrics) = &self.metrics {
                metrics.counter_inc("rounds.total", &[], 1);
            }
            self.check_cancelled()?;

            ctx.messages.push(ChatMessage::user(round_summary(&results)));
            report.agents.extend(results);
            if round == self.config.max_rounds {
                info!(round, "round cap reached");
            }
        }

        self.set_state(RunState::Summarizing);
        let reply = match finished {
            Some(reply) if !reply.trim().is_empty() => reply,
            _ => self.summarize(&ctx, &report.agents).await,
        };
        self.check_cancelled()?;

        if !report.plans.is_empty() {
            let plans: Vec<String> = report
                .plans
                .iter()
                .map(|plan| {
                    let draft = PlanDraft {
                        agents: plan.agents,
                        tasks: plan.tasks.clone(),
                    };
                    serde_json::to_string(&draft).unwrap_or_default()
                })
                .collect();
            self.runtime
                .record(&self.run_id, HistoryEntry::assistant(plans.join("\n")));
        }
        if !reply.is_empty() {
            self.runtime
                .record(&self.run_id, HistoryEntry::assistant(reply.clone()));
        }

        let tool_runs = ctx.tool_runs;
        report.orchestrator = Some(AgentReply {
            reply: reply.clone(),
            tool_runs: tool_runs.clone(),
        });
        Ok(EventPayload::OrchestratorDone { reply, tool_runs })
    }

    /// Plan once, retrying transient gateway failures with backoff.
    async fn plan_with_retries(
        &self,
        planner: &RoundPlanner,
        ctx: &mut PlannerContext,
        round: u32,
    ) -> Result<PlanOutcome, EngineError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = planner.plan(ctx, round, &self.stream, &self.cancel).await?;
            self.check_cancelled()?;

            let PlanOutcome::Error(e) = outcome else {
                return Ok(outcome);
            };
            if !e.is_retryable() {
                return Ok(PlanOutcome::Error(e));
            }
            if attempt > self.config.planner_retries {
                return Err(EngineError::PlannerExhausted { attempts: attempt, last: e });
            }

            let delay = e
                .suggested_delay()
                .unwrap_or_else(|| Duration::from_millis(250 * 2u64.pow(attempt - 1)))
                .min(Duration::from_secs(10));
            warn!(round, attempt, error = %e, delay_ms = delay.as_millis() as u64, "planner call failed, retrying");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run every worker of `plan`, publishing each result as it arrives.
    async fn dispatch(&self, plan: &Plan) -> Result<Vec<AgentResult>, EngineError> {
        let round = plan.round;
        self.set_state(RunState::Dispatching { round });
        let mut handle = self
            .pool
            .run_round(plan, &self.request.coder, &self.run_id, &self.cancel);

        let mut pending = handle.remaining();
        self.set_state(RunState::Awaiting { round, pending });

        let mut results = Vec::with_capacity(pending);
        while let Some(result) = handle.next().await {
            self.runtime.record(
                &self.run_id,
                HistoryEntry::assistant(result.reply.clone()).named(format!("agent-{}", result.agent_id)),
            );
            self.publish(EventPayload::AgentDone { result: result.clone() })?;
            pending = pending.saturating_sub(1);
            self.set_state(RunState::Awaiting { round, pending });
            results.push(result);
        }
        results.sort_by_key(|r| r.agent_id);
        Ok(results)
    }

    async fn summarize(&self, ctx: &PlannerContext, agents: &[AgentResult]) -> String {
        let mut messages = ctx.messages.clone();
        messages.push(ChatMessage::user(SUMMARY_REQUEST));
        let request = CompletionRequest::new(AgentRole::Summarizer, self.request.orchestrator.clone(), messages);

        match self.runtime.complete(request, &self.cancel).await {
            Ok(completion) if !completion.text_or_empty().trim().is_empty() => {
                completion.text_or_empty().trim().to_string()
            }
            Ok(_) => fallback_summary(agents),
            Err(e) => {
                warn!(error = %e, "summarizer failed, using agent replies");
                fallback_summary(agents)
            }
        }
    }
}

fn history_message(entry: HistoryEntry) -> ChatMessage {
    match entry.role {
        HistoryRole::User => ChatMessage::user(entry.content),
        HistoryRole::Assistant | HistoryRole::Tool => ChatMessage::assistant_text(entry.content),
    }
}

fn round_summary(results: &[AgentResult]) -> String {
    results
        .iter()
        .map(|r| format!("Agent {} result: {}", r.agent_id, r.reply))
        .collect::<Vec<_>>()
        .join("\n")
}

fn fallback_summary(agents: &[AgentResult]) -> String {
    round_summary(agents)
}

/// A run executing on its own task.
pub struct RunHandle {
    run_id: RunId,
    stream: Arc<EventStream>,
    state: watch::Receiver<RunState>,
    cancel: CancellationToken,
    join: Option<JoinHandle<RunReport>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn subscribe(&self) -> Subscription {
        self.stream.subscribe()
    }

    pub fn stream(&self) -> Arc<EventStream> {
        Arc::clone(&self.stream)
    }

    pub fn state(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    pub async fn wait(mut self) -> Result<RunReport, EngineError> {
        let join = self
            .join
            .take()
            .ok_or_else(|| EngineError::Internal("run already awaited".into()))?;
        join.await
            .map_err(|e| EngineError::Internal(format!("run task failed: {e}")))
    }
}
