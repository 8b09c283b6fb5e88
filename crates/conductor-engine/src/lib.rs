//! Orchestration engine: plans rounds of work, runs workers concurrently and
//! streams every outcome to subscribers as it happens.

pub mod agent;
pub mod config;
pub mod controller;
pub mod error;
pub mod planner;
pub mod pool;
pub mod router;
pub mod stream;
pub mod tools;
pub mod truncate;

pub use agent::{AgentRuntime, AgentSpec};
pub use config::EngineConfig;
pub use controller::{AgentReply, Conductor, RunController, RunHandle, RunReport, RunRequest, RunState};
pub use error::{AgentError, EngineError};
pub use planner::{PlanOutcome, PlannerContext, RoundPlanner};
pub use pool::{RoundHandle, WorkerPool};
pub use router::Route;
pub use stream::{EventStream, Published, StreamError, Subscription};
pub use tools::ToolRegistry;
