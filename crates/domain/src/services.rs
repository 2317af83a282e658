//! # 领域服务
//!
//! 不依赖存储的纯业务规则：失败重试策略与作业完成判定。

use serde::{Deserialize, Serialize};

use crate::entities::{JobState, TaskState, TaskStateCounts};

/// 失败后的处理决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 回到 Waiting 等待重新分发
    Requeue,
    /// 重试次数耗尽
    Fail,
}

impl RetryDecision {
    pub fn target_state(&self) -> TaskState {
        match self {
            RetryDecision::Requeue => TaskState::Waiting,
            RetryDecision::Fail => TaskState::Failure,
        }
    }
}

/// 任务失败重试策略
///
/// 每次失败先增加 `run_count`，增加后达到 `max_run_count` 即失败。
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_run_count: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_run_count: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_run_count: i32) -> Self {
        Self { max_run_count }
    }

    pub fn on_failure(&self, run_count: i32) -> RetryDecision {
        if run_count + 1 >= self.max_run_count {
            RetryDecision::Fail
        } else {
            RetryDecision::Requeue
        }
    }
}

/// 作业完成判定
pub struct JobCompletion;

impl JobCompletion {
    /// 没有待处理任务时返回作业的最终状态
    pub fn evaluate(counts: &TaskStateCounts) -> Option<JobState> {
        if counts.pending() > 0 {
            return None;
        }
        if counts.failure > 0 {
            Some(JobState::Failed)
        } else {
            Some(JobState::Success)
        }
    }
}
