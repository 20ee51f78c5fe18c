//! Explicit log-and-continue policy for non-fatal operations.
//!
//! Cleanup, pruning and auto-commit return ordinary `Result`s so tests can
//! assert on them. Callers that must not be blocked by a failure discard the
//! error through [`BestEffort::best_effort`], which records it at `warn`.

use std::fmt::Display;

use tracing::warn;

pub trait BestEffort<T> {
    /// Log a failure and continue. Returns the value on success.
    fn best_effort(self, what: &str) -> Option<T>;
}

impl<T, E: Display> BestEffort<T> for Result<T, E> {
    fn best_effort(self, what: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("{} failed (continuing): {}", what, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_effort_passes_value_through() {
        let ok: Result<u32, String> = Ok(7);
        assert_eq!(ok.best_effort("noop"), Some(7));
    }

    #[test]
    fn test_best_effort_swallows_error() {
        let err: Result<u32, String> = Err("disk full".to_string());
        assert_eq!(err.best_effort("prune"), None);
    }
}
