//! Platform shell helpers

use std::path::Path;

/// Shell program and its "run this string" flag for the current platform.
///
/// Prefers bash when it is installed, since setup scripts are commonly
/// written for it.
pub fn get_shell_command() -> (&'static str, &'static str) {
    if cfg!(windows) {
        ("cmd", "/C")
    } else if Path::new("/bin/bash").exists() {
        ("bash", "-c")
    } else {
        ("sh", "-c")
    }
}

/// Look up an executable on `PATH`
pub fn resolve_executable_path(executable: &str) -> Option<String> {
    which::which(executable)
        .ok()
        .map(|p| p.to_string_lossy().to_string())
}

/// Quote a single argument for a POSIX shell command line
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '='));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
