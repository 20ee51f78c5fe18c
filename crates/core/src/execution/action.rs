//! Executor action descriptors
//!
//! What an execution process runs: a coding agent turn (initial or
//! follow-up) or a script. Actions can be chained through `next_action`.

use serde::{Deserialize, Serialize};

/// Agent identities that can drive a coding-agent execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    ClaudeCode,
    Amp,
    Gemini,
    OpenCode,
}

/// How an agent writes its output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per stdout line
    StructuredJson,
    /// Free-form text
    PlainText,
}

/// What the structured processor does when a fresh user message arrives
/// after entries have already been emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStrategy {
    /// Keep appending.
    #[default]
    Default,
    /// The agent replays its own history on resume: clear everything
    /// rendered so far and renumber from zero.
    Resume,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude_code",
            Self::Amp => "amp",
            Self::Gemini => "gemini",
            Self::OpenCode => "opencode",
        }
    }

    pub fn log_format(&self) -> LogFormat {
        match self {
            Self::ClaudeCode | Self::Amp => LogFormat::StructuredJson,
            Self::Gemini | Self::OpenCode => LogFormat::PlainText,
        }
    }

    pub fn history_strategy(&self) -> HistoryStrategy {
        match self {
            Self::Amp => HistoryStrategy::Resume,
            _ => HistoryStrategy::Default,
        }
    }
}

/// Agent identity plus an optional replacement for its base command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent: AgentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_override: Option<String>,
}

impl AgentProfile {
    pub fn new(agent: AgentKind) -> Self {
        Self {
            agent,
            command_override: None,
        }
    }

    pub fn with_command_override(mut self, command: impl Into<String>) -> Self {
        self.command_override = Some(command.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptLanguage {
    Bash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptContext {
    SetupScript,
    CleanupScript,
    DevServer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorActionType {
    CodingAgentInitial {
        prompt: String,
        profile: AgentProfile,
    },
    CodingAgentFollowUp {
        prompt: String,
        session_id: String,
        profile: AgentProfile,
    },
    Script {
        script: String,
        language: ScriptLanguage,
        context: ScriptContext,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorAction {
    pub typ: ExecutorActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<Box<ExecutorAction>>,
}

impl ExecutorAction {
    pub fn new(typ: ExecutorActionType) -> Self {
        Self {
            typ,
            next_action: None,
        }
    }

    /// Chain another action to run after this one succeeds
    pub fn then(mut self, next: ExecutorAction) -> Self {
        self.next_action = Some(Box::new(next));
        self
    }

    pub fn profile(&self) -> Option<&AgentProfile> {
        match &self.typ {
            ExecutorActionType::CodingAgentInitial { profile, .. }
            | ExecutorActionType::CodingAgentFollowUp { profile, .. } => Some(profile),
            ExecutorActionType::Script { .. } => None,
        }
    }

    pub fn prompt(&self) -> Option<&str> {
        match &self.typ {
            ExecutorActionType::CodingAgentInitial { prompt, .. }
            | ExecutorActionType::CodingAgentFollowUp { prompt, .. } => Some(prompt),
            ExecutorActionType::Script { .. } => None,
        }
    }
}
