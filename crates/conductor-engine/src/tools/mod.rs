pub mod files;
pub mod patch;
pub mod paths;
pub mod shell;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use conductor_core::errors::ToolError;
use conductor_core::messages::ToolCall;
use conductor_core::tools::{Tool, ToolContext, ToolDefinition, ToolExecutor, ToolOutput, ToolStatus};

use crate::config::EngineConfig;
use crate::truncate::truncate_output;

pub use files::{ReadFileTool, WriteFileTool};
pub use patch::ChangeFileTool;
pub use shell::WriteCommandTool;

/// Registry of available tools, executing calls inside one workspace root.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    root: PathBuf,
    timeout: Duration,
    max_output: usize,
}

impl ToolRegistry {
    pub fn new(root: &Path, timeout: Duration, max_output: usize) -> Self {
        Self {
            tools: HashMap::new(),
            root: paths::canonical_root(root),
            timeout,
            max_output,
        }
    }

    /// Registry with `write_command`, `read_file`, `write_file` and `change_file`.
    pub fn with_builtins(root: &Path, config: &EngineConfig) -> Self {
        let mut registry = Self::new(root, config.tool_timeout, config.max_tool_output);
        registry.register(Arc::new(WriteCommandTool));
        registry.register(Arc::new(ReadFileTool));
        registry.register(Arc::new(WriteFileTool));
        registry.register(Arc::new(ChangeFileTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run a command line directly, outside any run.
    pub async fn run_command(&self, command: &str, cancel: &CancellationToken) -> ToolOutput {
        let call = ToolCall::new("write_command", serde_json::json!({ "command": command }));
        self.execute(&call, cancel).await
    }

    fn finish(&self, command: String, result: Result<String, ToolError>, started: Instant) -> ToolOutput {
        let (text, status) = match result {
            Ok(text) => (text, ToolStatus::Ok),
            Err(e) => (e.to_tool_output(), e.status()),
        };
        ToolOutput {
            command,
            result: truncate_output(&text, self.max_output),
            status,
            duration: started.elapsed(),
        }
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolOutput {
        let started = Instant::now();
        let Some(tool) = self.get(&call.name) else {
            return self.finish(
                call.name.clone(),
                Err(ToolError::Unavailable(format!("unknown tool {}", call.name))),
                started,
            );
        };

        let label = tool.label(&call.arguments);
        if !matches!(call.arguments, Value::Object(_)) {
            return self.finish(
                label,
                Err(ToolError::InvalidArguments("arguments must be a JSON object".into())),
                started,
            );
        }

        let ctx = ToolContext {
            root: self.root.clone(),
            timeout: self.timeout,
            cancel: cancel.clone(),
        };
        let result = tool.execute(&call.arguments, &ctx).await;
        let output = self.finish(label, result, started);
        debug!(
            tool = %call.name,
            status = ?output.status,
            duration_ms = output.duration.as_millis() as u64,
            "tool executed"
        );
        output
    }
}
