use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use conductor_core::errors::ToolError;
use conductor_core::tools::{Tool, ToolContext};

use super::files::required_str;
use super::paths;
use super::shell::BLOCKED_PATH;

/// Applies a unified diff with `git apply`, run from the workspace root.
pub struct ChangeFileTool;

#[async_trait]
impl Tool for ChangeFileTool {
    fn name(&self) -> &str {
        "change_file"
    }

    fn description(&self) -> &str {
        "Apply a git patch to a file. Call read_file first to get the current content and then send a unified diff patch."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "filename": {"type": "string"},
                "patch": {"type": "string"}
            },
            "required": ["filename", "patch"]
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let filename = required_str(args, "filename")?;
        let patch = required_str(args, "patch")?;
        if !paths::within_root(&ctx.root, filename) {
            return Err(ToolError::Blocked(BLOCKED_PATH.into()));
        }

        let mut child = tokio::process::Command::new("git")
            .args(["apply", "-"])
            .current_dir(&ctx.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Unavailable(format!("git: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(patch.as_bytes())
                .await
                .map_err(|e| ToolError::Unavailable(format!("git apply stdin: {e}")))?;
        }

        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
            result = tokio::time::timeout(ctx.timeout, child.wait_with_output()) => result
                .map_err(|_| ToolError::Timeout(ctx.timeout))?
                .map_err(|e| ToolError::Unavailable(e.to_string()))?,
        };

        if output.status.success() {
            return Ok(format!("Patch applied to {filename}."));
        }

        let current = tokio::fs::read_to_string(paths::resolve(&ctx.root, filename))
            .await
            .unwrap_or_default();
        Err(ToolError::NonZeroExit {
            code: output.status.code().unwrap_or(-1),
            output: format!(
                "Patch failed:\n{}\nCurrent file:\n{current}",
                String::from_utf8_lossy(&output.stderr)
            ),
        })
    }
}
