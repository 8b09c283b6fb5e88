use std::time::Duration;

/// Limits and toggles for the orchestration engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Upper bound on workers in one round, and on concurrently running workers overall.
    pub max_workers: u32,
    /// Worker count used when a request carries no hint.
    pub default_worker_hint: u32,
    pub max_rounds: u32,
    /// Extra planner attempts after a transient gateway failure.
    pub planner_retries: u32,
    /// Tool invocations allowed per agent, and per planning step.
    pub max_tool_invocations: u32,
    pub worker_timeout: Duration,
    /// Bound on a single planner, router or summarizer call.
    pub gateway_timeout: Duration,
    pub tool_timeout: Duration,
    /// Extra attempts for a tool call that timed out.
    pub tool_retries: u32,
    pub max_tool_output: usize,
    /// Records of earlier runs a new run sees as context.
    pub history_window: usize,
    pub routing_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            default_worker_hint: 2,
            max_rounds: 5,
            planner_retries: 2,
            max_tool_invocations: 16,
            worker_timeout: Duration::from_secs(300),
            gateway_timeout: Duration::from_secs(300),
            tool_timeout: Duration::from_secs(30),
            tool_retries: 1,
            max_tool_output: 256 * 1024,
            history_window: 40,
            routing_enabled: false,
        }
    }
}

impl EngineConfig {
    /// `min(hint, max_workers)`, falling back to the default hint.
    pub fn effective_cap(&self, hint: Option<u32>) -> u32 {
        hint.unwrap_or(self.default_worker_hint)
            .max(1)
            .min(self.max_workers)
    }
}
