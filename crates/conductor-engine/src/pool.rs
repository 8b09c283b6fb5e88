use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conductor_core::completion::{AgentRole, ModelSelection};
use conductor_core::ids::{AgentNumber, RunId};
use conductor_core::messages::ChatMessage;
use conductor_core::plan::{AgentResult, Plan};
use conductor_telemetry::MetricsRecorder;

use crate::agent::{AgentRuntime, AgentSpec};
use crate::error::AgentError;

/// System prompt for one worker, listing its tasks in plan order.
pub fn worker_prompt(agent: AgentNumber, tasks: &[String]) -> String {
    let list: Vec<String> = tasks.iter().map(|t| format!("- {t}")).collect();
    format!(
        "You are coder agent {agent}. Complete ONLY the following tasks in order:\n{}",
        list.join("\n")
    )
}

/// Bounded-concurrency executor for the workers of a round.
///
/// The semaphore is shared across rounds and runs, so `max_workers` bounds
/// the total number of workers talking to the gateway at once.
#[derive(Clone)]
pub struct WorkerPool {
    runtime: AgentRuntime,
    permits: Arc<Semaphore>,
    worker_timeout: Duration,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl WorkerPool {
    pub fn new(runtime: AgentRuntime, max_workers: u32, worker_timeout: Duration) -> Self {
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_workers.max(1) as usize)),
            worker_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Spawn one worker per agent slot of `plan`. Results are read from the returned handle.
    pub fn run_round(
        &self,
        plan: &Plan,
        selection: &ModelSelection,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) -> RoundHandle {
        let mut join_set = JoinSet::new();
        let mut pending = BTreeSet::new();

        for (agent, tasks) in plan.assignments() {
            pending.insert(agent);
            let worker = Worker {
                round: plan.round,
                agent,
                spec: AgentSpec {
                    run_id: run_id.clone(),
                    role: AgentRole::Worker,
                    selection: selection.clone(),
                    messages: vec![ChatMessage::system(worker_prompt(agent, &tasks))],
                },
                runtime: self.runtime.clone(),
                permits: Arc::clone(&self.permits),
                timeout: self.worker_timeout,
                cancel: cancel.child_token(),
                metrics: self.metrics.clone(),
            };
            join_set.spawn(worker.run());
        }

        info!(run_id = %run_id, round = plan.round, workers = pending.len(), "round dispatched");
        RoundHandle {
            round: plan.round,
            join_set,
            pending,
        }
    }
}

struct Worker {
    round: u32,
    agent: AgentNumber,
    spec: AgentSpec,
    runtime: AgentRuntime,
    permits: Arc<Semaphore>,
    timeout: Duration,
    cancel: CancellationToken,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Worker {
    async fn run(self) -> AgentResult {
        let Worker {
            round,
            agent,
            spec,
            runtime,
            permits,
            timeout,
            cancel,
            metrics,
        } = self;

        let _permit = tokio::select! {
            _ = cancel.cancelled() => {
                return AgentResult::failed(round, agent, AgentError::Cancelled.to_string(), Vec::new());
            }
            permit = permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return AgentResult::failed(round, agent, "worker pool shut down", Vec::new());
                }
            },
        };

        let started = Instant::now();
        let mut runs = Vec::new();
        let outcome = {
            let work = runtime.run_agent(spec, &cancel, &mut runs);
            tokio::time::timeout(timeout, AssertUnwindSafe(work).catch_unwind()).await
        };

        let result = match outcome {
            Ok(Ok(Ok(reply))) => {
                debug!(round, agent, tool_runs = runs.len(), "worker completed");
                AgentResult::completed(round, agent, reply, runs)
            }
            Ok(Ok(Err(e))) => {
                warn!(round, agent, error = %e, "worker failed");
                AgentResult::failed(round, agent, e.to_string(), runs)
            }
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(round, agent, panic = %msg, "worker panicked");
                AgentResult::failed(round, agent, AgentError::Panicked(msg).to_string(), runs)
            }
            Err(_) => {
                cancel.cancel();
                warn!(round, agent, timeout_secs = timeout.as_secs(), "worker timed out");
                AgentResult::failed(round, agent, AgentError::Timeout(timeout).to_string(), runs)
            }
        };

        if let Some(metrics) = &metrics {
            let status = if result.is_failed() { "failed" } else { "completed" };
            metrics.counter_inc("workers.completed", &[("status", status)], 1);
            metrics.histogram_observe("worker.duration_ms", &[], started.elapsed().as_millis() as f64);
        }
        result
    }
}

/// The in-flight workers of one round.
pub struct RoundHandle {
    round: u32,
    join_set: JoinSet<AgentResult>,
    pending: BTreeSet<AgentNumber>,
}

impl RoundHandle {
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Number of workers that have not reported yet.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Next finished worker, in completion order. `None` once every worker has reported.
    ///
    /// A task lost to an abort still yields a failed result for its slot.
    pub async fn next(&mut self) -> Option<AgentResult> {
        loop {
            match self.join_set.join_next().await {
                Some(Ok(result)) => {
                    if self.pending.remove(&result.agent_id) {
                        return Some(result);
                    }
                }
                Some(Err(e)) => {
                    error!(round = self.round, error = %e, "worker task lost");
                }
                None => {
                    let agent = self.pending.pop_first()?;
                    return Some(AgentResult::failed(self.round, agent, "worker task lost", Vec::new()));
                }
            }
        }
    }

    /// Wait for every remaining worker.
    pub async fn collect(mut self) -> Vec<AgentResult> {
        let mut results = Vec::with_capacity(self.pending.len());
        while let Some(result) = self.next().await {
            results.push(result);
        }
        results
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
