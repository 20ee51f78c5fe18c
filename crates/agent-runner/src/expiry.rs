//! Expired container selection

use chrono::{DateTime, Duration, Utc};
use conductor_core::attempt::TaskAttempt;
use conductor_core::execution::ExecutionProcess;
use uuid::Uuid;

/// Default idle time after which an attempt's container is reclaimed
pub const DEFAULT_WORKTREE_TTL_HOURS: i64 = 72;

/// Attempts whose containers can be reclaimed at `now`.
///
/// `processes` must be a snapshot of every execution process of the given
/// attempts. An attempt with any process that has not completed is never
/// selected, however old it is.
pub fn select_expired_attempts(
    attempts: &[TaskAttempt],
    processes: &[ExecutionProcess],
    now: DateTime<Utc>,
    ttl: Duration,
) -> Vec<Uuid> {
    attempts
        .iter()
        .filter(|attempt| !attempt.worktree_deleted && attempt.container_ref.is_some())
        .filter_map(|attempt| {
            let mut last_activity = attempt.updated_at;
            for process in processes.iter().filter(|p| p.task_attempt_id == attempt.id) {
                match process.completed_at {
                    Some(completed_at) if !process.is_running() => {
                        last_activity = last_activity.max(completed_at);
                    }
                    _ => return None,
                }
            }
            (now - last_activity >= ttl).then_some(attempt.id)
        })
        .collect()
}
