//! 领域仓储抽象
//!
//! 任务存储是状态机的唯一事实来源。所有状态迁移都是基于当前状态的条件更新，
//! 作业计数在同一个存储操作中维护。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entities::{
    Analyst, AnalystFilter, AssetCounts, Job, JobFilter, JobState, LockState,
    Task, TaskError, TaskErrorFilter, TaskFilter,
};
use crate::value_objects::StateChange;
use archivist_core::SchedulerResult;

/// 作业仓储
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 在一个存储操作中写入作业、它的初始任务和作业间依赖，任何一步失败都不留下数据
    ///
    /// 依赖的作业不存在时返回未找到错误；已经结束的依赖作业立即视为解除。
    /// 返回带最新计数的作业。
    async fn create(&self, job: &Job, tasks: &[Task]) -> SchedulerResult<Job>;
    async fn get(&self, id: Uuid) -> SchedulerResult<Option<Job>>;
    async fn list(&self, filter: &JobFilter) -> SchedulerResult<Vec<Job>>;

    /// 修改作业状态，`expected` 不为空时仅在当前状态匹配时生效
    async fn set_state(
        &self,
        id: Uuid,
        new_state: JobState,
        expected: Option<JobState>,
    ) -> SchedulerResult<bool>;

    async fn set_paused(&self, id: Uuid, paused: bool) -> SchedulerResult<bool>;

    /// 仅在作业尚未开始时记录开始时间
    async fn touch_started(&self, id: Uuid, at: DateTime<Utc>) -> SchedulerResult<bool>;

    /// 作业结束后解除其他作业对它的依赖，每条依赖只解除一次，
    /// 返回因此不再等待任何作业的作业ID
    async fn resolve_job_dependents(&self, job_id: Uuid) -> SchedulerResult<Vec<Uuid>>;
}

/// 任务仓储
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 批量创建任务
    ///
    /// 初始状态在存储内根据依赖决定：依赖全部成功为 Waiting，
    /// 任一依赖 Failure/Skipped 为 Skipped，否则为 Depend。
    /// 作业的状态计数和资产总数随之增加。
    async fn create_batch(&self, tasks: &[Task]) -> SchedulerResult<Vec<Task>>;

    async fn get(&self, id: Uuid) -> SchedulerResult<Option<Task>>;
    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>>;

    /// 可分发的候选任务：Waiting，作业进行中、未暂停且未达并发上限，
    /// 按作业优先级降序、任务创建时间升序排列
    async fn dispatch_candidates(&self, limit: usize) -> SchedulerResult<Vec<Task>>;

    /// Waiting -> Queued 的条件更新，记录主机和心跳时间
    async fn claim(
        &self,
        task_id: Uuid,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> SchedulerResult<Option<Task>>;

    /// 应用条件状态变更，条件不满足时返回 `None`
    async fn apply_state_change(&self, change: &StateChange) -> SchedulerResult<Option<Task>>;

    /// 任务在该主机上运行时刷新心跳时间
    async fn update_ping(
        &self,
        task_id: Uuid,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 同时累加任务和所属作业的资产计数
    async fn increment_asset_counts(
        &self,
        task_id: Uuid,
        delta: &AssetCounts,
    ) -> SchedulerResult<bool>;

    /// Queued/Running 且心跳早于 `cutoff` 的任务
    async fn find_orphans(&self, cutoff: DateTime<Utc>) -> SchedulerResult<Vec<Task>>;

    /// 处于 Depend 且依赖该任务的任务
    async fn find_dependents(&self, task_id: Uuid) -> SchedulerResult<Vec<Task>>;
}

/// Analyst仓储
#[async_trait]
pub trait AnalystRepository: Send + Sync {
    /// 按endpoint插入或更新，状态置为Up并刷新心跳时间，保留锁定状态和创建时间
    async fn upsert(&self, analyst: &Analyst) -> SchedulerResult<Analyst>;
    async fn get(&self, endpoint: &str) -> SchedulerResult<Option<Analyst>>;
    async fn list(&self, filter: &AnalystFilter) -> SchedulerResult<Vec<Analyst>>;

    /// 仅在Analyst仍为Up且最后心跳早于 `cutoff` 时标记为Down，
    /// 期间到达的心跳会让更新不生效
    async fn mark_down_if_silent(
        &self,
        endpoint: &str,
        cutoff: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    async fn set_lock_state(&self, endpoint: &str, lock_state: LockState)
        -> SchedulerResult<bool>;
    async fn set_task_id(&self, endpoint: &str, task_id: Option<Uuid>) -> SchedulerResult<bool>;

    /// 仅在Analyst仍为Down且最后心跳早于 `cutoff` 时删除
    async fn delete_if_silent(&self, endpoint: &str, cutoff: DateTime<Utc>)
        -> SchedulerResult<bool>;
}

/// 任务错误记录仓储
#[async_trait]
pub trait TaskErrorRepository: Send + Sync {
    async fn create(&self, error: &TaskError) -> SchedulerResult<TaskError>;
    async fn list(&self, filter: &TaskErrorFilter) -> SchedulerResult<Vec<TaskError>>;
}
