use serde::{Deserialize, Serialize};

use crate::ids::RunId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    User,
    Assistant,
    Tool,
}

impl HistoryRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// One append-only conversation record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: String,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::User,
            name: None,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::Assistant,
            name: None,
            content: content.into(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Record of a tool call as the model issued it.
    pub fn tool_call(name: &str, args: &serde_json::Value) -> Self {
        Self::assistant(format!("[tool_call] {name} {args}"))
    }
}

/// A record together with the run that wrote it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryRecord {
    pub run_id: Option<RunId>,
    pub entry: HistoryEntry,
}

#[derive(Debug, thiserror::Error)]
#[error("history store: {0}")]
pub struct HistoryError(pub String);

/// Append-only conversation log shared by every run.
pub trait HistoryStore: Send + Sync {
    fn append(&self, run_id: Option<&RunId>, entry: HistoryEntry) -> Result<(), HistoryError>;

    /// Records in append order, optionally limited to one run.
    fn list(&self, run_id: Option<&RunId>) -> Result<Vec<HistoryEntry>, HistoryError>;

    /// The newest `limit` records across all runs, oldest first.
    fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, HistoryError>;
}
