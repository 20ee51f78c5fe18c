//! Lifecycle events for notification and analytics consumers

use chrono::{DateTime, Utc};
use conductor_core::execution::{ExecutionProcessStatus, RunReason};
use conductor_core::logs::LogMsg;
use serde::Serialize;
use uuid::Uuid;

/// Event emitted by the execution manager
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum LifecycleEvent {
    #[serde(rename = "execution:started")]
    ExecutionStarted {
        execution_id: Uuid,
        task_attempt_id: Uuid,
        run_reason: RunReason,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "execution:completed")]
    ExecutionCompleted {
        execution_id: Uuid,
        task_attempt_id: Uuid,
        run_reason: RunReason,
        status: ExecutionProcessStatus,
        exit_code: Option<i64>,
        /// False for killed executions, which must not trigger a failure alert
        notify_failure: bool,
        timestamp: DateTime<Utc>,
    },

    /// A message was pushed to an execution's store
    #[serde(rename = "log")]
    Log { execution_id: Uuid, msg: LogMsg },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution:started",
            Self::ExecutionCompleted { .. } => "execution:completed",
            Self::Log { .. } => "log",
        }
    }

    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::ExecutionCompleted { execution_id, .. }
            | Self::Log { execution_id, .. } => *execution_id,
        }
    }

    pub(crate) fn started(execution_id: Uuid, task_attempt_id: Uuid, run_reason: RunReason) -> Self {
        Self::ExecutionStarted {
            execution_id,
            task_attempt_id,
            run_reason,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn completed(
        execution_id: Uuid,
        task_attempt_id: Uuid,
        run_reason: RunReason,
        status: ExecutionProcessStatus,
        exit_code: Option<i64>,
    ) -> Self {
        Self::ExecutionCompleted {
            execution_id,
            task_attempt_id,
            run_reason,
            status,
            exit_code,
            notify_failure: status == ExecutionProcessStatus::Failed,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let id = Uuid::new_v4();
        let event = LifecycleEvent::completed(
            id,
            Uuid::new_v4(),
            RunReason::CodingAgent,
            ExecutionProcessStatus::Killed,
            Some(143),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "execution:completed");
        assert_eq!(value["status"], "killed");
        assert_eq!(value["notify_failure"], false);
        assert_eq!(event.name(), "execution:completed");
        assert_eq!(event.execution_id(), id);
    }

    #[test]
    fn test_failed_notifies() {
        let event = LifecycleEvent::completed(
            Uuid::new_v4(),
            Uuid::new_v4(),
            RunReason::SetupScript,
            ExecutionProcessStatus::Failed,
            Some(1),
        );
        assert!(matches!(
            event,
            LifecycleEvent::ExecutionCompleted { notify_failure: true, .. }
        ));
    }
}
