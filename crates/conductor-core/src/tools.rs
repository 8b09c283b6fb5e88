use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::ToolError;
use crate::messages::ToolCall;

/// Outcome class of one tool invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
    Timeout,
}

/// Tool definition sent to the model as a callable function.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Context available to tools during execution.
pub struct ToolContext {
    /// Commands and file paths may not escape this directory.
    pub root: PathBuf,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

/// A single built-in capability (run a command, read a file, ...).
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    /// Label recorded on the tool run. Defaults to the tool name.
    fn label(&self, _args: &serde_json::Value) -> String {
        self.name().to_string()
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<String, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

/// Result of executing one command through a [`ToolExecutor`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub command: String,
    pub result: String,
    pub status: ToolStatus,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ToolOutput {
    pub fn into_run(self) -> ToolRun {
        ToolRun {
            command: self.command,
            result: self.result,
            status: self.status,
        }
    }
}

/// One tool invocation as reported on events and in aggregated replies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolRun {
    #[serde(rename = "cmd")]
    pub command: String,
    pub result: String,
    pub status: ToolStatus,
}

/// Executes tool calls issued by the planner or by workers.
///
/// Failures are folded into the returned status; executing never aborts the caller.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolOutput;
}

/// Serde helper for Duration as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
