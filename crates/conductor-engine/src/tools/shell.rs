use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;

use conductor_core::errors::ToolError;
use conductor_core::tools::{Tool, ToolContext};

use super::paths;

/// Runs a command without a shell. Arguments are split shell-style; path
/// arguments that leave the workspace root are refused.
pub struct WriteCommandTool;

pub const BLOCKED_PATH: &str = "path outside working directory.";

/// Split a command line and check every path-like token against the root.
pub fn split_command(root: &std::path::Path, command: &str) -> Result<Vec<String>, ToolError> {
    let tokens = shlex::split(command)
        .ok_or_else(|| ToolError::InvalidArguments("unbalanced quotes in command".into()))?;
    if tokens.is_empty() {
        return Err(ToolError::InvalidArguments("empty command".into()));
    }
    if tokens
        .iter()
        .any(|t| paths::token_is_path(t) && !paths::within_root(root, t))
    {
        return Err(ToolError::Blocked(BLOCKED_PATH.into()));
    }
    Ok(tokens)
}

#[async_trait]
impl Tool for WriteCommandTool {
    fn name(&self) -> &str {
        "write_command"
    }

    fn description(&self) -> &str {
        "Execute a Unix command and see the result"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"command": {"type": "string"}},
            "required": ["command"]
        })
    }

    fn label(&self, args: &Value) -> String {
        args.get("command")
            .and_then(Value::as_str)
            .unwrap_or(self.name())
            .to_string()
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("command is required".into()))?;
        let tokens = split_command(&ctx.root, command)?;

        let child = tokio::process::Command::new(&tokens[0])
            .args(&tokens[1..])
            .current_dir(&ctx.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Unavailable(format!("{}: {e}", tokens[0])))?;

        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
            result = tokio::time::timeout(ctx.timeout, child.wait_with_output()) => result
                .map_err(|_| ToolError::Timeout(ctx.timeout))?
                .map_err(|e| ToolError::Unavailable(e.to_string()))?,
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(ToolError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                output: combined,
            })
        }
    }
}
