use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentNumber, RunId};
use crate::plan::{AgentResult, Plan};
use crate::tools::ToolRun;

/// Progress of a run, as pushed to observers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "plan_ready")]
    PlanReady { plan: Plan },

    #[serde(rename = "agent_done")]
    AgentDone { result: AgentResult },

    /// A tool the planner ran itself, outside any worker.
    #[serde(rename = "orchestrator_tool")]
    OrchestratorTool { round: u32, index: u32, run: ToolRun },

    #[serde(rename = "coder_done")]
    CoderDone { reply: String, tool_runs: Vec<ToolRun> },

    #[serde(rename = "orchestrator_done")]
    OrchestratorDone { reply: String, tool_runs: Vec<ToolRun> },

    #[serde(rename = "run_error")]
    RunError { reason: String, kind: String },
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PlanReady { .. } => "plan_ready",
            Self::AgentDone { .. } => "agent_done",
            Self::OrchestratorTool { .. } => "orchestrator_tool",
            Self::CoderDone { .. } => "coder_done",
            Self::OrchestratorDone { .. } => "orchestrator_done",
            Self::RunError { .. } => "run_error",
        }
    }

    /// Deduplication key. A run publishes at most one event per key.
    pub fn identity(&self) -> IdentityKey {
        match self {
            Self::PlanReady { plan } => IdentityKey::Plan { round: plan.round },
            Self::AgentDone { result } => IdentityKey::Agent {
                round: result.round,
                agent: result.agent_id,
            },
            Self::OrchestratorTool { round, index, .. } => IdentityKey::OrchestratorTool {
                round: *round,
                index: *index,
            },
            Self::CoderDone { .. } | Self::OrchestratorDone { .. } | Self::RunError { .. } => {
                IdentityKey::Terminal
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.identity(), IdentityKey::Terminal)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    Plan { round: u32 },
    Agent { round: u32, agent: AgentNumber },
    OrchestratorTool { round: u32, index: u32 },
    Terminal,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan { round } => write!(f, "plan:{round}"),
            Self::Agent { round, agent } => write!(f, "agent:{round}:{agent}"),
            Self::OrchestratorTool { round, index } => write!(f, "tool:{round}:{index}"),
            Self::Terminal => f.write_str("terminal"),
        }
    }
}

/// A published event, stamped by the run's event stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub seq: u64,
    /// Rendered identity key, for client-side deduplication.
    pub key: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl RunEvent {
    pub fn new(run_id: RunId, seq: u64, payload: EventPayload) -> Self {
        Self {
            run_id,
            seq,
            key: payload.identity().to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }
}
