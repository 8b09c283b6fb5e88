//! Run manager: connects the engine to the server.
//!
//! Every submitted run gets a `runs` row, a recorder persisting its events and
//! a completion task that writes the terminal status once the run ends.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use conductor_core::ids::RunId;
use conductor_engine::{Conductor, EventStream, RunReport, RunRequest, RunState, Subscription};
use conductor_store::{Database, RunEventRepo, RunRepo, RunStatus};
use conductor_telemetry::MetricsRecorder;

use crate::error::ServerError;
use crate::recorder::spawn_recorder;

fn record_active(metrics: Option<&MetricsRecorder>, active: &DashMap<RunId, ActiveRun>) {
    if let Some(metrics) = metrics {
        metrics.gauge_set("runs.active", &[], active.len() as f64);
    }
}

/// A run that has been accepted and is executing.
pub struct StartedRun {
    pub run_id: RunId,
    /// Attached before the run started: sees every event.
    pub subscription: Subscription,
    /// Resolves with the aggregate report once the run's status is persisted.
    pub report: oneshot::Receiver<RunReport>,
}

struct ActiveRun {
    stream: Arc<EventStream>,
    cancel: CancellationToken,
    state: watch::Receiver<RunState>,
    started_at: Instant,
}

pub struct RunManager {
    conductor: Arc<Conductor>,
    db: Database,
    active: Arc<DashMap<RunId, ActiveRun>>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl RunManager {
    pub fn new(conductor: Arc<Conductor>, db: Database) -> Self {
        Self {
            conductor,
            db,
            active: Arc::new(DashMap::new()),
            metrics: None,
        }
    }

    /// Report the number of active runs as the `runs.active` gauge.
    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn conductor(&self) -> &Arc<Conductor> {
        &self.conductor
    }

    /// Persist and start a run.
    pub fn start(&self, request: RunRequest) -> Result<StartedRun, ServerError> {
        if request.prompt.trim().is_empty() {
            return Err(ServerError::InvalidRequest("prompt must not be empty".into()));
        }

        let controller = self.conductor.create_run(request.clone());
        let run_id = controller.run_id().clone();
        let runs = RunRepo::new(self.db.clone());
        runs.create(&run_id, &request.prompt, request.orchestrator_enabled)?;

        let recorder = spawn_recorder(RunEventRepo::new(self.db.clone()), controller.subscribe());
        let subscription = controller.subscribe();

        self.active.insert(
            run_id.clone(),
            ActiveRun {
                stream: controller.stream(),
                cancel: controller.cancel_token(),
                state: controller.state(),
                started_at: Instant::now(),
            },
        );
        record_active(self.metrics.as_deref(), &self.active);

        let handle = controller.spawn();
        let (report_tx, report_rx) = oneshot::channel();
        let active = Arc::clone(&self.active);
        let metrics = self.metrics.clone();
        let task_run_id = run_id.clone();
        tokio::spawn(async move {
            let report = match handle.wait().await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(run_id = %task_run_id, error = %e, "run task failed");
                    RunReport {
                        run_id: task_run_id.clone(),
                        plans: Vec::new(),
                        coder: None,
                        orchestrator: None,
                        agents: Vec::new(),
                        error: Some(e.to_string()),
                    }
                }
            };
            let stored = recorder.await.unwrap_or_else(|e| {
                tracing::error!(run_id = %task_run_id, error = %e, "event recorder failed");
                0
            });

            let (status, reply) = match (&report.error, final_reply(&report)) {
                (Some(_), _) => (RunStatus::Failed, None),
                (None, reply) => (RunStatus::Completed, reply),
            };
            if let Err(e) = runs.finish(&task_run_id, status, reply, report.error.as_deref()) {
                tracing::error!(run_id = %task_run_id, error = %e, "failed to persist run status");
            }

            let elapsed = active
                .remove(&task_run_id)
                .map(|(_, run)| run.started_at.elapsed().as_millis() as u64);
            record_active(metrics.as_deref(), &active);
            tracing::info!(run_id = %task_run_id, %status, events = stored, elapsed_ms = ?elapsed, "run finished");
            let _ = report_tx.send(report);
        });

        Ok(StartedRun {
            run_id,
            subscription,
            report: report_rx,
        })
    }

    /// Cancel a running run. Returns false when it is not active.
    pub fn abort(&self, run_id: &RunId) -> bool {
        match self.active.get(run_id) {
            Some(run) => {
                run.cancel.cancel();
                tracing::info!(run_id = %run_id, "run abort requested");
                true
            }
            None => false,
        }
    }

    /// Attach to an active run. Finished runs are served from the store instead.
    pub fn subscribe(&self, run_id: &RunId) -> Option<Subscription> {
        self.active.get(run_id).map(|run| run.stream.subscribe())
    }

    pub fn state(&self, run_id: &RunId) -> Option<RunState> {
        self.active.get(run_id).map(|run| run.state.borrow().clone())
    }

    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.active.contains_key(run_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Cancel every active run. Returns how many were signalled.
    pub fn abort_all(&self) -> usize {
        let mut count = 0;
        for run in self.active.iter() {
            run.cancel.cancel();
            count += 1;
        }
        count
    }
}

/// The reply a finished run hands back to the user.
pub fn final_reply(report: &RunReport) -> Option<&str> {
    report
        .orchestrator
        .as_ref()
        .or(report.coder.as_ref())
        .map(|r| r.reply.as_str())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use conductor_core::completion::{ModelSelection, ProviderKind};
    use conductor_engine::{EngineConfig, ToolRegistry};
    use conductor_llm::MockGateway;
    use conductor_store::HistoryRepo;

    pub fn conductor(gateway: MockGateway, db: &Database) -> Arc<Conductor> {
        let config = EngineConfig::default();
        let tools = Arc::new(ToolRegistry::with_builtins(&std::env::temp_dir(), &config));
        Arc::new(Conductor::new(
            config,
            Arc::new(gateway),
            tools,
            Arc::new(HistoryRepo::new(db.clone())),
        ))
    }

    pub fn request(prompt: &str, orchestrator_enabled: bool) -> RunRequest {
        RunRequest {
            prompt: prompt.into(),
            orchestrator: ModelSelection::new(ProviderKind::OpenAi, "gpt-4o"),
            coder: ModelSelection::new(ProviderKind::OpenAi, "gpt-4o-mini"),
            worker_hint: None,
            orchestrator_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{conductor, request};
    use super::*;
    use conductor_core::completion::AgentRole;
    use conductor_llm::{MockGateway, MockResponse};
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn run_is_persisted_with_events() {
        let db = Database::in_memory().unwrap();
        let gateway = MockGateway::scripted().on(AgentRole::Coder, vec![MockResponse::text("hello there")]);
        let manager = RunManager::new(conductor(gateway, &db), db.clone());

        let started = manager.start(request("say hi", false)).unwrap();
        let events: Vec<_> = started.subscription.collect().await;
        let report = started.report.await.unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "coder_done");
        assert_eq!(report.coder.unwrap().reply, "hello there");

        let row = RunRepo::new(db.clone()).get(&started.run_id).unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Completed);
        assert_eq!(row.reply.as_deref(), Some("hello there"));
        assert_eq!(RunEventRepo::new(db).list(&started.run_id).unwrap().len(), 1);
        assert!(!manager.is_active(&started.run_id));
    }

    #[tokio::test]
    async fn empty_prompt_rejected() {
        let db = Database::in_memory().unwrap();
        let manager = RunManager::new(conductor(MockGateway::scripted(), &db), db);
        let err = manager.start(request("   ", false)).err().unwrap();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn abort_marks_run_failed() {
        let db = Database::in_memory().unwrap();
        let gateway = MockGateway::scripted().on(
            AgentRole::Coder,
            vec![MockResponse::delayed(Duration::from_secs(30), MockResponse::text("late"))],
        );
        let manager = RunManager::new(conductor(gateway, &db), db.clone());

        let started = manager.start(request("slow", false)).unwrap();
        assert!(manager.is_active(&started.run_id));
        assert!(manager.state(&started.run_id).is_some());
        assert!(manager.abort(&started.run_id));

        let report = started.report.await.unwrap();
        assert!(report.error.is_some());
        let row = RunRepo::new(db).get(&started.run_id).unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Failed);
        assert!(!manager.abort(&started.run_id));
    }

    #[tokio::test]
    async fn subscribe_unknown_run() {
        let db = Database::in_memory().unwrap();
        let manager = RunManager::new(conductor(MockGateway::scripted(), &db), db);
        assert!(manager.subscribe(&RunId::new()).is_none());
        assert_eq!(manager.abort_all(), 0);
    }

    #[tokio::test]
    async fn active_gauge_follows_runs() {
        let db = Database::in_memory().unwrap();
        let metrics = Arc::new(MetricsRecorder::in_memory());
        let gateway = MockGateway::scripted().on(
            AgentRole::Coder,
            vec![MockResponse::delayed(Duration::from_secs(30), MockResponse::text("late"))],
        );
        let manager = RunManager::new(conductor(gateway, &db), db).with_metrics(Arc::clone(&metrics));

        let started = manager.start(request("slow", false)).unwrap();
        assert_eq!(metrics.gauge_get("runs.active", &[]), 1.0);

        manager.abort(&started.run_id);
        started.report.await.unwrap();
        assert_eq!(metrics.gauge_get("runs.active", &[]), 0.0);
    }
}
