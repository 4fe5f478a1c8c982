use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::meta::RunStatus;

/// Everything a build run emits, in the shape subscribers consume over SSE.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AssistantText { content: String, timestamp: String },
    ToolUse { content: serde_json::Value, timestamp: String },
    ToolResult { content: serde_json::Value, timestamp: String },
    Result { content: String, timestamp: String },
    Error { content: String, timestamp: String },
    /// Synthetic stream terminator; appended by the orchestrator, never by the build job.
    Done,
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

impl AgentEvent {
    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::AssistantText { content: content.into(), timestamp: now_rfc3339() }
    }

    pub fn tool_use(content: serde_json::Value) -> Self {
        Self::ToolUse { content, timestamp: now_rfc3339() }
    }

    pub fn tool_result(content: serde_json::Value) -> Self {
        Self::ToolResult { content, timestamp: now_rfc3339() }
    }

    pub fn result(content: impl Into<String>) -> Self {
        Self::Result { content: content.into(), timestamp: now_rfc3339() }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error { content: content.into(), timestamp: now_rfc3339() }
    }

    /// Status a terminal event transitions the run to, if any.
    pub fn terminal_status(&self) -> Option<RunStatus> {
        match self {
            AgentEvent::Result { .. } => Some(RunStatus::Completed),
            AgentEvent::Error { .. } => Some(RunStatus::Error),
            _ => None,
        }
    }
}
