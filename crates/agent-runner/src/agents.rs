//! Command lines for executor actions

use std::path::Path;

use conductor_core::execution::{AgentKind, AgentProfile, ExecutorAction, ExecutorActionType};

use crate::error::{ExecutorError, Result};
use crate::process::ProcessSpec;
use crate::shell::{resolve_executable_path, shell_quote};

/// Base command used when the profile does not override it
fn default_base_command(agent: AgentKind) -> &'static str {
    match agent {
        AgentKind::ClaudeCode => "npx -y @anthropic-ai/claude-code@latest",
        AgentKind::Amp => "npx -y @sourcegraph/amp@latest",
        AgentKind::Gemini => "npx -y @google/gemini-cli@latest",
        AgentKind::OpenCode => "opencode",
    }
}

fn initial_args(agent: AgentKind) -> Vec<String> {
    let args: &[&str] = match agent {
        AgentKind::ClaudeCode => &[
            "-p",
            "--verbose",
            "--output-format=stream-json",
            "--dangerously-skip-permissions",
        ],
        AgentKind::Amp => &["--execute", "--stream-json", "--dangerously-allow-all"],
        AgentKind::Gemini => &["--yolo"],
        AgentKind::OpenCode => &["run"],
    };
    args.iter().map(|s| s.to_string()).collect()
}

fn follow_up_args(agent: AgentKind, session_id: &str) -> Vec<String> {
    let session = shell_quote(session_id);
    match agent {
        AgentKind::ClaudeCode => {
            let mut args = initial_args(agent);
            args.extend(["--resume".to_string(), session]);
            args
        }
        AgentKind::Amp => {
            let mut args = vec!["threads".to_string(), "continue".to_string(), session];
            args.extend(initial_args(agent));
            args
        }
        // No resume support, the prompt has to carry the context
        AgentKind::Gemini => initial_args(agent),
        AgentKind::OpenCode => {
            let mut args = initial_args(agent);
            args.extend(["--session".to_string(), session]);
            args
        }
    }
}

/// Full shell command line for an agent run
pub fn agent_command_line(profile: &AgentProfile, session_id: Option<&str>) -> String {
    let base = profile
        .command_override
        .as_deref()
        .unwrap_or_else(|| default_base_command(profile.agent));
    let args = match session_id {
        Some(id) => follow_up_args(profile.agent, id),
        None => initial_args(profile.agent),
    };
    std::iter::once(base.to_string())
        .chain(args)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the process to spawn for `action` inside `working_dir`.
///
/// Agents receive their prompt on stdin; scripts run as-is.
pub fn build_process_spec(action: &ExecutorAction, working_dir: &Path) -> Result<ProcessSpec> {
    let spec = match &action.typ {
        ExecutorActionType::CodingAgentInitial { prompt, profile } => {
            ensure_program(profile)?;
            ProcessSpec::shell(&agent_command_line(profile, None), working_dir).with_stdin(prompt.as_str())
        }
        ExecutorActionType::CodingAgentFollowUp {
            prompt,
            session_id,
            profile,
        } => {
            if session_id.trim().is_empty() {
                return Err(ExecutorError::invalid_action(
                    "follow-up requires the session id of the previous run",
                ));
            }
            ensure_program(profile)?;
            ProcessSpec::shell(&agent_command_line(profile, Some(session_id)), working_dir)
                .with_stdin(prompt.as_str())
        }
        ExecutorActionType::Script { script, .. } => {
            if script.trim().is_empty() {
                return Err(ExecutorError::invalid_action("script is empty"));
            }
            ProcessSpec::shell(script, working_dir)
        }
    };
    Ok(spec.env("NO_COLOR", "1"))
}

/// Fail early with a clear message when the agent's program is not installed
fn ensure_program(profile: &AgentProfile) -> Result<()> {
    let base = profile
        .command_override
        .as_deref()
        .unwrap_or_else(|| default_base_command(profile.agent));
    let Some(program) = base.split_whitespace().next() else {
        return Err(ExecutorError::invalid_action("agent command is empty"));
    };
    if resolve_executable_path(program).is_none() {
        return Err(ExecutorError::spawn_failed(format!(
            "'{}' not found on PATH, cannot start {}",
            program,
            profile.agent.as_str()
        )));
    }
    Ok(())
}
