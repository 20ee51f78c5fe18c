//! Normalized entry types
//!
//! The typed, renderable units a log processor derives from raw agent
//! output.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultValueType {
    Markdown,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub r#type: ToolResultValueType,
    /// A JSON string for markdown, a structured value for JSON
    pub value: Value,
}

impl ToolResult {
    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            r#type: ToolResultValueType::Markdown,
            value: Value::String(text.into()),
        }
    }

    pub fn json(value: Value) -> Self {
        Self {
            r#type: ToolResultValueType::Json,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandExitStatus {
    ExitCode { code: i32 },
    Success { success: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRunResult {
    pub exit_status: Option<CommandExitStatus>,
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEntryType {
    UserMessage,
    AssistantMessage,
    ToolUse {
        tool_name: String,
        action_type: ActionType,
    },
    SystemMessage,
    ErrorMessage,
    Thinking,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEntry {
    pub timestamp: Option<String>,
    pub entry_type: NormalizedEntryType,
    pub content: String,
    pub metadata: Option<Value>,
}

impl NormalizedEntry {
    pub fn new(entry_type: NormalizedEntryType, content: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            entry_type,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(NormalizedEntryType::SystemMessage, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(NormalizedEntryType::ErrorMessage, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(NormalizedEntryType::AssistantMessage, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(NormalizedEntryType::UserMessage, content)
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
}

/// What a tool call does, as far as the conversation view is concerned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionType {
    FileRead {
        path: String,
    },
    FileEdit {
        path: String,
        changes: Vec<FileChange>,
    },
    CommandRun {
        command: String,
        #[serde(default)]
        result: Option<CommandRunResult>,
    },
    Search {
        query: String,
    },
    WebFetch {
        url: String,
    },
    Tool {
        tool_name: String,
        #[serde(default)]
        arguments: Option<Value>,
        #[serde(default)]
        result: Option<ToolResult>,
    },
    TaskCreate {
        description: String,
    },
    PlanPresentation {
        plan: String,
    },
    TodoManagement {
        todos: Vec<TodoItem>,
        operation: String,
    },
    Other {
        description: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FileChange {
    /// Create or overwrite the file
    Write { content: String },
    Delete,
    Rename { new_path: String },
    Edit {
        /// Unified diff with file header and hunks
        unified_diff: String,
        /// Whether hunk line numbers can be trusted
        has_line_numbers: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_run_entry_shape() {
        let entry = NormalizedEntry::new(
            NormalizedEntryType::ToolUse {
                tool_name: "Bash".to_string(),
                action_type: ActionType::CommandRun {
                    command: "npm test".to_string(),
                    result: Some(CommandRunResult {
                        exit_status: Some(CommandExitStatus::Success { success: true }),
                        output: Some("5 passed".to_string()),
                    }),
                },
            },
            "`npm test`",
        );

        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({
                "timestamp": null,
                "entry_type": {
                    "type": "tool_use",
                    "tool_name": "Bash",
                    "action_type": {
                        "action": "command_run",
                        "command": "npm test",
                        "result": {
                            "exit_status": {"type": "success", "success": true},
                            "output": "5 passed"
                        }
                    }
                },
                "content": "`npm test`",
                "metadata": null
            })
        );
    }

    #[test]
    fn test_file_edit_changes_shape() {
        let action = ActionType::FileEdit {
            path: "src/lib.rs".to_string(),
            changes: vec![
                FileChange::Rename {
                    new_path: "src/main.rs".to_string(),
                },
                FileChange::Delete,
            ],
        };
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({
                "action": "file_edit",
                "path": "src/lib.rs",
                "changes": [
                    {"action": "rename", "new_path": "src/main.rs"},
                    {"action": "delete"}
                ]
            })
        );
    }

    #[test]
    fn test_tool_result_markdown_is_string() {
        let result = ToolResult::markdown("**done**");
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"type": {"type": "markdown"}, "value": "**done**"})
        );
    }
}
