//! Analyst上报的任务生命周期事件

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{AssetCounts, TaskState};
use crate::value_objects::TaskSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: Uuid,
    pub job_id: Uuid,
    /// 上报事件的Analyst
    pub endpoint: String,
    pub kind: TaskEventKind,
}

impl TaskEvent {
    pub fn new(task_id: Uuid, job_id: Uuid, endpoint: impl Into<String>, kind: TaskEventKind) -> Self {
        Self {
            task_id,
            job_id,
            endpoint: endpoint.into(),
            kind,
        }
    }

    pub fn started(task_id: Uuid, job_id: Uuid, endpoint: impl Into<String>) -> Self {
        Self::new(task_id, job_id, endpoint, TaskEventKind::Started)
    }

    pub fn stopped(task_id: Uuid, job_id: Uuid, endpoint: impl Into<String>, exit_code: i32) -> Self {
        Self::new(
            task_id,
            job_id,
            endpoint,
            TaskEventKind::Stopped {
                exit_code,
                error: None,
                asset_counts: None,
            },
        )
    }

    pub fn expand(
        task_id: Uuid,
        job_id: Uuid,
        endpoint: impl Into<String>,
        children: Vec<TaskSpec>,
    ) -> Self {
        Self::new(task_id, job_id, endpoint, TaskEventKind::Expand { children })
    }

    pub fn error(
        task_id: Uuid,
        job_id: Uuid,
        endpoint: impl Into<String>,
        error: TaskErrorEvent,
    ) -> Self {
        Self::new(task_id, job_id, endpoint, TaskEventKind::Error(error))
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.name()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventKind {
    Started,
    Stopped {
        exit_code: i32,
        #[serde(default)]
        error: Option<TaskErrorEvent>,
        #[serde(default)]
        asset_counts: Option<AssetCounts>,
    },
    Expand {
        children: Vec<TaskSpec>,
    },
    Error(TaskErrorEvent),
    Message {
        text: String,
    },
}

impl TaskEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEventKind::Started => "started",
            TaskEventKind::Stopped { .. } => "stopped",
            TaskEventKind::Expand { .. } => "expand",
            TaskEventKind::Error(_) => "error",
            TaskEventKind::Message { .. } => "message",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskErrorEvent {
    #[serde(default)]
    pub path: Option<String>,
    pub message: String,
    #[serde(default)]
    pub processor: Option<String>,
    #[serde(default)]
    pub fatal: bool,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub stack_trace: Vec<String>,
}

impl TaskErrorEvent {
    pub fn new(message: impl Into<String>, fatal: bool) -> Self {
        Self {
            path: None,
            message: message.into(),
            processor: None,
            fatal,
            phase: "execute".to_string(),
            stack_trace: Vec::new(),
        }
    }

    pub fn with_processor(mut self, processor: impl Into<String>) -> Self {
        self.processor = Some(processor.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// 事件处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    Rejected(RejectReason),
}

impl EventOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, EventOutcome::Applied)
    }
}

/// 事件被拒绝的原因，拒绝不会修改任何状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    UnknownTask,
    JobMismatch { expected: Uuid },
    HostMismatch { holder: Option<String> },
    InvalidState { state: TaskState, action: &'static str },
    /// 条件更新失败，任务已被并发修改
    Conflict,
    Invalid(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnknownTask => write!(f, "任务不存在"),
            RejectReason::JobMismatch { expected } => write!(f, "作业不匹配，任务属于 {expected}"),
            RejectReason::HostMismatch { holder } => match holder {
                Some(h) => write!(f, "任务由 {h} 持有"),
                None => write!(f, "任务未被任何Analyst持有"),
            },
            RejectReason::InvalidState { state, action } => {
                write!(f, "任务状态 {state} 不允许 {action}")
            }
            RejectReason::Conflict => write!(f, "任务状态已被并发修改"),
            RejectReason::Invalid(msg) => write!(f, "{msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = TaskEvent::stopped(Uuid::new_v4(), Uuid::new_v4(), "h1:5000", 1);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"]["type"], "stopped");
        assert_eq!(value["kind"]["exit_code"], 1);

        let parsed: TaskEvent = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.event_type(), "stopped");
    }

    #[test]
    fn test_reject_reason_display() {
        let reason = RejectReason::InvalidState {
            state: TaskState::Waiting,
            action: "stopped",
        };
        assert!(reason.to_string().contains("WAITING"));
        assert!(!EventOutcome::Rejected(reason).is_applied());
    }
}
