//! Processor for agents that stream one JSON object per line
//!
//! Understands the `stream-json` message shape (`system`, `assistant`,
//! `user`, `result`). Tool calls are correlated with their results by id:
//! a result never creates a new entry, it replaces the entry of the call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use conductor_core::execution::HistoryStrategy;
use conductor_core::logs::{
    ActionType, CommandExitStatus, CommandRunResult, ConversationPatch, FileChange,
    NormalizedEntry, NormalizedEntryType, TodoItem, ToolResult,
};
use conductor_core::Parsed;
use serde::Deserialize;
use serde_json::{json, Value};
use similar::TextDiff;
use tracing::{debug, trace};

use super::entry_index::EntryIndexProvider;
use super::lines::LineBuffer;
use super::normalizer::Normalized;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamMessage {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        message: AgentMessage,
    },
    User {
        message: AgentMessage,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct AgentMessage {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: MessageContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Items(Vec<ContentItem>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Items(Vec::new())
    }
}

impl MessageContent {
    fn into_items(self) -> Vec<ContentItem> {
        match self {
            Self::Text(text) => vec![ContentItem::Text { text }],
            Self::Items(items) => items,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentItem {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

/// Tools whose arguments map onto a specific action type. Anything else
/// becomes a generic tool entry.
#[derive(Debug, Deserialize)]
#[serde(tag = "name", content = "input")]
enum KnownTool {
    #[serde(alias = "read_file")]
    Read {
        #[serde(alias = "path")]
        file_path: String,
    },
    #[serde(alias = "edit_file")]
    Edit {
        #[serde(alias = "path")]
        file_path: String,
        #[serde(default, alias = "old_str")]
        old_string: String,
        #[serde(default, alias = "new_str")]
        new_string: String,
    },
    MultiEdit {
        file_path: String,
        #[serde(default)]
        edits: Vec<EditPair>,
    },
    #[serde(alias = "create_file")]
    Write {
        #[serde(alias = "path")]
        file_path: String,
        #[serde(default)]
        content: String,
    },
    #[serde(alias = "bash")]
    Bash {
        #[serde(alias = "cmd")]
        command: String,
    },
    Grep {
        pattern: String,
    },
    Glob {
        pattern: String,
    },
    #[serde(rename = "LS")]
    Ls {
        path: String,
    },
    WebFetch {
        url: String,
    },
    WebSearch {
        query: String,
    },
    Task {
        #[serde(default)]
        description: String,
    },
    ExitPlanMode {
        plan: String,
    },
    TodoWrite {
        todos: Vec<TodoItem>,
    },
}

#[derive(Debug, Deserialize)]
struct EditPair {
    #[serde(default)]
    old_string: String,
    #[serde(default)]
    new_string: String,
}

impl KnownTool {
    fn classify(name: &str, input: &Value) -> Option<Self> {
        serde_json::from_value(json!({ "name": name, "input": input })).ok()
    }
}

/// An emitted tool call awaiting its result
struct ToolCallState {
    index: usize,
    entry: NormalizedEntry,
}

pub struct StreamJsonProcessor {
    lines: LineBuffer,
    index_provider: EntryIndexProvider,
    strategy: HistoryStrategy,
    worktree_path: PathBuf,
    tool_calls: HashMap<String, ToolCallState>,
    model_reported: bool,
}

impl StreamJsonProcessor {
    pub fn new(
        index_provider: EntryIndexProvider,
        strategy: HistoryStrategy,
        worktree_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            lines: LineBuffer::default(),
            index_provider,
            strategy,
            worktree_path: worktree_path.into(),
            tool_calls: HashMap::new(),
            model_reported: false,
        }
    }

    /// Feed a chunk of stdout; complete lines are processed immediately
    pub fn process(&mut self, chunk: &str) -> Normalized {
        let mut out = Normalized::default();
        for line in self.lines.push(chunk) {
            out.extend(self.process_line(&line));
        }
        out
    }

    /// Process an unterminated final line, if any
    pub fn flush(&mut self) -> Normalized {
        match self.lines.take_partial() {
            Some(line) => self.process_line(&line),
            None => Normalized::default(),
        }
    }

    pub fn process_line(&mut self, line: &str) -> Normalized {
        let mut out = Normalized::default();
        let line = line.trim();
        if line.is_empty() {
            return out;
        }

        let value = match Parsed::<Value>::from_json(line) {
            Parsed::Parsed(value) => value,
            Parsed::Raw(raw) => {
                self.add(NormalizedEntry::system(raw), &mut out);
                return out;
            }
        };

        out.session_id = value
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        match serde_json::from_value::<StreamMessage>(value) {
            Ok(message) => self.handle_message(message, &mut out),
            Err(e) => {
                debug!("Unrecognized stream-json line ({}): {}", e, line);
                self.add(NormalizedEntry::system(line), &mut out);
            }
        }
        out
    }

    fn handle_message(&mut self, message: StreamMessage, out: &mut Normalized) {
        match message {
            StreamMessage::System { subtype, model } => {
                if subtype.as_deref() == Some("init") {
                    if let Some(model) = model {
                        self.report_model(&model, out);
                    }
                }
            }
            StreamMessage::Assistant { message } => {
                if let Some(model) = &message.model {
                    self.report_model(model, out);
                }
                for item in message.content.into_items() {
                    match item {
                        ContentItem::Text { text } => {
                            if !text.trim().is_empty() {
                                self.add(NormalizedEntry::assistant(text), out);
                            }
                        }
                        ContentItem::Thinking { thinking } => {
                            if !thinking.trim().is_empty() {
                                self.add(
                                    NormalizedEntry::new(NormalizedEntryType::Thinking, thinking),
                                    out,
                                );
                            }
                        }
                        ContentItem::ToolUse { id, name, input } => {
                            self.start_tool_call(id, name, input, out);
                        }
                        ContentItem::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => self.finish_tool_call(&tool_use_id, &content, is_error.unwrap_or(false), out),
                        ContentItem::Unknown => {}
                    }
                }
            }
            StreamMessage::User { message } => {
                for item in message.content.into_items() {
                    match item {
                        ContentItem::Text { text } => self.user_text(text, out),
                        ContentItem::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => self.finish_tool_call(&tool_use_id, &content, is_error.unwrap_or(false), out),
                        _ => {}
                    }
                }
            }
            StreamMessage::Result { is_error, result } => {
                if is_error {
                    let text = result
                        .as_ref()
                        .map(result_text)
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| "Agent reported an error".to_string());
                    self.add(NormalizedEntry::error(text), out);
                }
            }
            StreamMessage::Unknown => trace!("Ignoring unknown stream-json message"),
        }
    }

    fn add(&self, entry: NormalizedEntry, out: &mut Normalized) -> usize {
        let index = self.index_provider.next();
        out.patches
            .push(ConversationPatch::add_normalized_entry(index, entry));
        index
    }

    fn report_model(&mut self, model: &str, out: &mut Normalized) {
        if self.model_reported {
            return;
        }
        self.model_reported = true;
        self.add(
            NormalizedEntry::system(format!("System initialized with model: {}", model)),
            out,
        );
    }

    fn user_text(&mut self, text: String, out: &mut Normalized) {
        if self.strategy == HistoryStrategy::Resume && self.index_provider.current() > 0 {
            // The resumed session replays its history, so clear what is rendered
            for index in (0..self.index_provider.current()).rev() {
                out.patches.push(ConversationPatch::remove(index));
            }
            self.index_provider.reset();
            self.tool_calls.clear();
        }
        self.add(NormalizedEntry::user(text), out);
    }

    fn start_tool_call(&mut self, id: String, name: String, input: Value, out: &mut Normalized) {
        let (action_type, content) = self.describe_tool(&name, input);
        let entry = NormalizedEntry::new(
            NormalizedEntryType::ToolUse {
                tool_name: name,
                action_type,
            },
            content,
        )
        .with_metadata(json!({ "tool_use_id": id }));

        let index = self.add(entry.clone(), out);
        self.tool_calls.insert(id, ToolCallState { index, entry });
    }

    fn finish_tool_call(&mut self, id: &str, content: &Value, is_error: bool, out: &mut Normalized) {
        let Some(mut state) = self.tool_calls.remove(id) else {
            trace!("Tool result for unknown call {}", id);
            return;
        };
        let NormalizedEntryType::ToolUse { action_type, .. } = &mut state.entry.entry_type else {
            return;
        };

        match action_type {
            ActionType::CommandRun { result, .. } => {
                *result = Some(CommandRunResult {
                    exit_status: Some(CommandExitStatus::Success { success: !is_error }),
                    output: Some(result_text(content)),
                });
            }
            ActionType::Tool { result, .. } => {
                *result = Some(tool_result(content));
            }
            // The call already carries everything worth showing
            _ => return,
        }

        out.patches
            .push(ConversationPatch::replace(state.index, state.entry));
    }

    fn describe_tool(&self, name: &str, input: Value) -> (ActionType, String) {
        let Some(tool) = KnownTool::classify(name, &input) else {
            let content = match name.strip_prefix("mcp__") {
                Some(rest) => format!("mcp:{}", rest.replace("__", ":")),
                None => name.to_string(),
            };
            return (
                ActionType::Tool {
                    tool_name: name.to_string(),
                    arguments: Some(input),
                    result: None,
                },
                content,
            );
        };

        match tool {
            KnownTool::Read { file_path } => {
                let path = self.relative(&file_path);
                let content = format!("`{}`", path);
                (ActionType::FileRead { path }, content)
            }
            KnownTool::Edit {
                file_path,
                old_string,
                new_string,
            } => {
                let path = self.relative(&file_path);
                let changes = vec![FileChange::Edit {
                    unified_diff: unified_diff(&path, &old_string, &new_string),
                    has_line_numbers: false,
                }];
                let content = format!("`{}`", path);
                (ActionType::FileEdit { path, changes }, content)
            }
            KnownTool::MultiEdit { file_path, edits } => {
                let path = self.relative(&file_path);
                let changes = edits
                    .iter()
                    .map(|edit| FileChange::Edit {
                        unified_diff: unified_diff(&path, &edit.old_string, &edit.new_string),
                        has_line_numbers: false,
                    })
                    .collect();
                let content = format!("`{}`", path);
                (ActionType::FileEdit { path, changes }, content)
            }
            KnownTool::Write { file_path, content } => {
                let path = self.relative(&file_path);
                let label = format!("`{}`", path);
                (
                    ActionType::FileEdit {
                        path,
                        changes: vec![FileChange::Write { content }],
                    },
                    label,
                )
            }
            KnownTool::Bash { command } => {
                let content = format!("`{}`", command);
                (
                    ActionType::CommandRun {
                        command,
                        result: None,
                    },
                    content,
                )
            }
            KnownTool::Grep { pattern } => {
                let content = format!("`{}`", pattern);
                (ActionType::Search { query: pattern }, content)
            }
            KnownTool::Glob { pattern } => {
                let content = format!("Find files: `{}`", pattern);
                (ActionType::Search { query: pattern }, content)
            }
            KnownTool::Ls { path } => {
                let path = self.relative(&path);
                (
                    ActionType::Other {
                        description: format!("List directory {}", path),
                    },
                    format!("`{}`", path),
                )
            }
            KnownTool::WebFetch { url } => (ActionType::WebFetch { url: url.clone() }, url),
            KnownTool::WebSearch { query } => {
                let content = format!("Web search: `{}`", query);
                (ActionType::Search { query }, content)
            }
            KnownTool::Task { description } => {
                let content = format!("Task: `{}`", description);
                (ActionType::TaskCreate { description }, content)
            }
            KnownTool::ExitPlanMode { plan } => {
                (ActionType::PlanPresentation { plan: plan.clone() }, plan)
            }
            KnownTool::TodoWrite { todos } => (
                ActionType::TodoManagement {
                    todos,
                    operation: "write".to_string(),
                },
                "TODO list updated".to_string(),
            ),
        }
    }

    fn relative(&self, path: &str) -> String {
        match Path::new(path).strip_prefix(&self.worktree_path) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().into_owned(),
            _ => path.to_string(),
        }
    }
}

fn unified_diff(path: &str, old: &str, new: &str) -> String {
    let old_header = format!("a/{}", path);
    let new_header = format!("b/{}", path);
    let diff = TextDiff::from_lines(old, new);
    diff.unified_diff()
        .context_radius(3)
        .header(&old_header, &new_header)
        .to_string()
}

/// Flatten tool result content (a string, or a list of text blocks) to text
fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                other => other.get("text").and_then(Value::as_str).map(str::to_string),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn tool_result(content: &Value) -> ToolResult {
    match content {
        Value::String(_) | Value::Array(_) | Value::Null => {
            match Parsed::<Value>::from_json(&result_text(content)) {
                Parsed::Parsed(value) => ToolResult::json(value),
                Parsed::Raw(text) => ToolResult::markdown(text),
            }
        }
        structured => ToolResult::json(structured.clone()),
    }
}
