use async_trait::async_trait;
use serde_json::Value;

use conductor_core::errors::ToolError;
use conductor_core::tools::{Tool, ToolContext};

use super::paths;
use super::shell::BLOCKED_PATH;

pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("{key} is required")))
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Return the contents of a text file"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"filename": {"type": "string"}},
            "required": ["filename"]
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let filename = required_str(args, "filename")?;
        if !paths::within_root(&ctx.root, filename) {
            return Err(ToolError::Blocked(BLOCKED_PATH.into()));
        }
        let path = paths::resolve(&ctx.root, filename);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(format!("{filename} not found.")),
            Err(e) => Err(ToolError::Unavailable(format!("cannot read {filename}: {e}"))),
        }
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "filename": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["filename", "content"]
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let filename = required_str(args, "filename")?;
        let content = required_str(args, "content")?;
        if !paths::within_root(&ctx.root, filename) {
            return Err(ToolError::Blocked(BLOCKED_PATH.into()));
        }

        let path = paths::resolve(&ctx.root, filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Unavailable(format!("cannot create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ToolError::Unavailable(format!("cannot write {filename}: {e}")))?;

        Ok(format!("Wrote {filename} ({} bytes).", content.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn temp_root() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("conductor-files-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        paths::canonical_root(&dir)
    }

    fn ctx(root: PathBuf) -> ToolContext {
        ToolContext {
            root,
            timeout: Duration::from_secs(5),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn write_then_read() {
        let root = temp_root();
        let ctx = ctx(root.clone());

        let msg = WriteFileTool
            .execute(&serde_json::json!({"filename": "nested/a.txt", "content": "hi there"}), &ctx)
            .await
            .unwrap();
        assert_eq!(msg, "Wrote nested/a.txt (8 bytes).");
        assert!(root.join("nested/a.txt").exists());

        let content = ReadFileTool
            .execute(&serde_json::json!({"filename": "nested/a.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(content, "hi there");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn missing_file_is_reported_not_failed() {
        let root = temp_root();
        let out = ReadFileTool
            .execute(&serde_json::json!({"filename": "nope.txt"}), &ctx(root.clone()))
            .await
            .unwrap();
        assert_eq!(out, "nope.txt not found.");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn writes_outside_root_are_blocked() {
        let root = temp_root();
        let err = WriteFileTool
            .execute(&serde_json::json!({"filename": "../escape.txt", "content": "x"}), &ctx(root.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Blocked(_)));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn missing_argument() {
        let err = WriteFileTool
            .execute(&serde_json::json!({"filename": "a.txt"}), &ctx(temp_root()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(m) if m == "content is required"));
    }
}
