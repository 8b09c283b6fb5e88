use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::errors::PlanValidationError;
use crate::ids::AgentNumber;
use crate::tools::ToolRun;

/// One unit of work assigned to a worker slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub agent: AgentNumber,
    pub desc: String,
}

/// A plan exactly as the planner produced it, before validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub agents: u32,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl PlanDraft {
    /// A draft with nothing to dispatch signals that the planner is finished.
    pub fn is_empty(&self) -> bool {
        self.agents == 0 && self.tasks.is_empty()
    }

    /// Check the draft against the worker cap and turn it into a dispatchable plan.
    pub fn validate(self, round: u32, cap: u32) -> Result<Plan, PlanValidationError> {
        if self.agents == 0 {
            return Err(PlanValidationError::NoWorkers);
        }
        if self.agents > cap {
            return Err(PlanValidationError::ExceedsCap {
                declared: self.agents,
                cap,
            });
        }

        let mut used = BTreeSet::new();
        for task in &self.tasks {
            if task.agent == 0 || task.agent > self.agents {
                return Err(PlanValidationError::AgentOutOfRange {
                    agent: task.agent,
                    declared: self.agents,
                });
            }
            if task.desc.trim().is_empty() {
                return Err(PlanValidationError::EmptyDescription { agent: task.agent });
            }
            used.insert(task.agent);
        }

        if (used.len() as u32) < self.agents {
            return Err(PlanValidationError::OrphanWorkers {
                declared: self.agents,
                used: used.len() as u32,
            });
        }

        Ok(Plan {
            round,
            agents: self.agents,
            tasks: self.tasks,
        })
    }
}

/// A validated plan: every slot in `1..=agents` owns at least one task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub round: u32,
    pub agents: u32,
    pub tasks: Vec<Task>,
}

impl Plan {
    /// Task descriptions grouped by worker, each list in plan order.
    pub fn assignments(&self) -> BTreeMap<AgentNumber, Vec<String>> {
        let mut map: BTreeMap<AgentNumber, Vec<String>> = BTreeMap::new();
        for task in &self.tasks {
            map.entry(task.agent).or_default().push(task.desc.clone());
        }
        map
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Completed,
    Failed,
}

/// The single report a worker produces for its round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub round: u32,
    #[serde(rename = "id")]
    pub agent_id: AgentNumber,
    pub reply: String,
    pub tool_runs: Vec<ToolRun>,
    pub status: AgentStatus,
}

impl AgentResult {
    pub fn completed(round: u32, agent_id: AgentNumber, reply: String, tool_runs: Vec<ToolRun>) -> Self {
        Self {
            round,
            agent_id,
            reply,
            tool_runs,
            status: AgentStatus::Completed,
        }
    }

    pub fn failed(
        round: u32,
        agent_id: AgentNumber,
        reason: impl Into<String>,
        tool_runs: Vec<ToolRun>,
    ) -> Self {
        Self {
            round,
            agent_id,
            reply: reason.into(),
            tool_runs,
            status: AgentStatus::Failed,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == AgentStatus::Failed
    }
}
