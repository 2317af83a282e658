//! 单个任务的命令处理
//!
//! 每个入口都先读取任务当前状态做守卫检查，再以条件更新写回，
//! 重复或乱序的事件在守卫或条件更新处被拒绝。

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use archivist_core::{SchedulerError, SchedulerResult};
use archivist_domain::{
    entities::{AssetCounts, JobState, Task, TaskError, TaskFilter, TaskState},
    events::{EventOutcome, RejectReason, TaskErrorEvent, TaskEvent, TaskEventKind},
    repositories::{JobRepository, TaskErrorRepository, TaskRepository},
    services::{JobCompletion, RetryDecision, RetryPolicy},
    task_dependency_service::{DependencyResolution, TaskDependencyService},
    value_objects::{StateChange, TaskSpec},
};

use crate::metrics;

/// 经由事件通道执行的命令
#[derive(Debug, Clone)]
pub enum TaskCommand {
    /// Analyst上报的生命周期事件
    Event(TaskEvent),
    /// 心跳超时的任务，`cutoff` 之后有过心跳则不处理
    Expire { task_id: Uuid, cutoff: DateTime<Utc> },
    Skip { task_id: Uuid },
    Retry { task_id: Uuid },
}

impl TaskCommand {
    pub fn task_id(&self) -> Uuid {
        match self {
            TaskCommand::Event(event) => event.task_id,
            TaskCommand::Expire { task_id, .. }
            | TaskCommand::Skip { task_id }
            | TaskCommand::Retry { task_id } => *task_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskCommand::Event(event) => event.kind.name(),
            TaskCommand::Expire { .. } => "expire",
            TaskCommand::Skip { .. } => "skip",
            TaskCommand::Retry { .. } => "retry",
        }
    }
}

fn rejected(reason: RejectReason) -> EventOutcome {
    EventOutcome::Rejected(reason)
}

fn invalid_state(task: &Task, action: &'static str) -> EventOutcome {
    rejected(RejectReason::InvalidState {
        state: task.state,
        action,
    })
}

pub struct TaskEventHandler {
    jobs: Arc<dyn JobRepository>,
    tasks: Arc<dyn TaskRepository>,
    task_errors: Arc<dyn TaskErrorRepository>,
    retry_policy: RetryPolicy,
}

impl TaskEventHandler {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        tasks: Arc<dyn TaskRepository>,
        task_errors: Arc<dyn TaskErrorRepository>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            jobs,
            tasks,
            task_errors,
            retry_policy,
        }
    }

    pub async fn handle(&self, command: TaskCommand) -> SchedulerResult<EventOutcome> {
        let task_id = command.task_id();
        let name = command.name();

        let outcome = match command {
            TaskCommand::Event(event) => self.handle_event(event).await?,
            TaskCommand::Expire { task_id, cutoff } => self.expire(task_id, cutoff).await?,
            TaskCommand::Skip { task_id } => self.skip(task_id).await?,
            TaskCommand::Retry { task_id } => self.retry(task_id).await?,
        };

        if let EventOutcome::Rejected(reason) = &outcome {
            warn!("任务 {} 的 {} 命令被拒绝: {}", task_id, name, reason);
        }
        Ok(outcome)
    }

    async fn handle_event(&self, event: TaskEvent) -> SchedulerResult<EventOutcome> {
        let Some(task) = self.tasks.get(event.task_id).await? else {
            return Ok(rejected(RejectReason::UnknownTask));
        };
        if task.job_id != event.job_id {
            return Ok(rejected(RejectReason::JobMismatch {
                expected: task.job_id,
            }));
        }

        match event.kind {
            TaskEventKind::Started => self.on_started(&task, &event.endpoint).await,
            TaskEventKind::Stopped {
                exit_code,
                error,
                asset_counts,
            } => {
                self.on_stopped(&task, &event.endpoint, exit_code, error, asset_counts)
                    .await
            }
            TaskEventKind::Expand { children } => {
                self.on_expand(&task, &event.endpoint, &children).await
            }
            TaskEventKind::Error(error) => self.on_error(&task, &event.endpoint, &error).await,
            TaskEventKind::Message { text } => {
                warn!("{} 来自 {} 的消息: {}", task.entity_description(), event.endpoint, text);
                Ok(EventOutcome::Applied)
            }
        }
    }

    fn check_host(task: &Task, endpoint: &str) -> Option<EventOutcome> {
        if task.is_held_by(endpoint) {
            None
        } else {
            Some(rejected(RejectReason::HostMismatch {
                holder: task.host.clone(),
            }))
        }
    }

    async fn on_started(&self, task: &Task, endpoint: &str) -> SchedulerResult<EventOutcome> {
        if task.state != TaskState::Queued {
            return Ok(invalid_state(task, "started"));
        }
        if let Some(outcome) = Self::check_host(task, endpoint) {
            return Ok(outcome);
        }

        let change =
            StateChange::new(task.id, TaskState::Queued, TaskState::Running).with_host(endpoint);
        let Some(updated) = self.tasks.apply_state_change(&change).await? else {
            return Ok(rejected(RejectReason::Conflict));
        };

        self.jobs
            .touch_started(updated.job_id, updated.time_started.unwrap_or(change.at))
            .await?;
        metrics::record_task_state(TaskState::Running);
        info!("{} 开始运行", updated.entity_description());
        Ok(EventOutcome::Applied)
    }

    async fn on_stopped(
        &self,
        task: &Task,
        endpoint: &str,
        exit_code: i32,
        error: Option<TaskErrorEvent>,
        asset_counts: Option<AssetCounts>,
    ) -> SchedulerResult<EventOutcome> {
        if task.state != TaskState::Running {
            return Ok(invalid_state(task, "stopped"));
        }
        if let Some(outcome) = Self::check_host(task, endpoint) {
            return Ok(outcome);
        }

        let base = StateChange::new(task.id, TaskState::Running, TaskState::Success)
            .with_host(endpoint)
            .with_exit_status(exit_code);
        let (change, decision) = if exit_code == 0 {
            (
                base.with_asset_delta(asset_counts.unwrap_or_default()),
                None,
            )
        } else {
            let decision = self.retry_policy.on_failure(task.run_count);
            let change = StateChange {
                new_state: decision.target_state(),
                ..base
            }
            .with_run_increment();
            (change, Some(decision))
        };

        let Some(updated) = self.tasks.apply_state_change(&change).await? else {
            return Ok(rejected(RejectReason::Conflict));
        };

        if let Some(error) = error {
            self.record_error(&updated, endpoint, &error).await?;
        }
        self.after_failure(&updated, decision, &format!("Hard task failure, exit {exit_code}"), endpoint)
            .await?;
        self.after_transition(&updated).await?;
        Ok(EventOutcome::Applied)
    }

    async fn on_expand(
        &self,
        task: &Task,
        endpoint: &str,
        children: &[TaskSpec],
    ) -> SchedulerResult<EventOutcome> {
        if task.state != TaskState::Running {
            return Ok(invalid_state(task, "expand"));
        }
        if let Some(outcome) = Self::check_host(task, endpoint) {
            return Ok(outcome);
        }
        if let Err(msg) = children.iter().try_for_each(TaskSpec::validate) {
            return Ok(rejected(RejectReason::Invalid(msg)));
        }
        if children.is_empty() {
            return Ok(EventOutcome::Applied);
        }

        let job = self
            .jobs
            .get(task.job_id)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(task.job_id))?;
        let created = self
            .tasks
            .create_batch(&TaskDependencyService::build_tasks(&job, children))
            .await?;

        info!(
            "{} 扩展出 {} 个子任务",
            task.entity_description(),
            created.len()
        );
        Ok(EventOutcome::Applied)
    }

    async fn on_error(
        &self,
        task: &Task,
        endpoint: &str,
        error: &TaskErrorEvent,
    ) -> SchedulerResult<EventOutcome> {
        self.record_error(task, endpoint, error).await?;

        let delta = if error.fatal {
            AssetCounts::errors(1)
        } else {
            AssetCounts::warnings(1)
        };
        self.tasks.increment_asset_counts(task.id, &delta).await?;
        metrics::record_task_error(error.processor.as_deref());
        Ok(EventOutcome::Applied)
    }

    async fn expire(&self, task_id: Uuid, cutoff: DateTime<Utc>) -> SchedulerResult<EventOutcome> {
        let Some(task) = self.tasks.get(task_id).await? else {
            return Ok(rejected(RejectReason::UnknownTask));
        };
        if !task.state.holds_host() {
            return Ok(invalid_state(&task, "expire"));
        }
        if task.time_ping.unwrap_or(task.time_modified) >= cutoff {
            debug!("{} 已恢复心跳，不再视为孤儿任务", task.entity_description());
            return Ok(rejected(RejectReason::Conflict));
        }

        let decision = self.retry_policy.on_failure(task.run_count);
        let mut change =
            StateChange::new(task.id, task.state, decision.target_state()).with_run_increment();
        if let Some(host) = &task.host {
            change = change.with_host(host.clone());
        }
        let Some(updated) = self.tasks.apply_state_change(&change).await? else {
            return Ok(rejected(RejectReason::Conflict));
        };

        warn!(
            "{} 心跳超时 (Analyst: {})，处理结果: {}",
            updated.entity_description(),
            task.host.as_deref().unwrap_or("-"),
            updated.state
        );
        let endpoint = task.host.clone().unwrap_or_default();
        self.after_failure(&updated, Some(decision), "Task timed out", &endpoint)
            .await?;
        self.after_transition(&updated).await?;
        Ok(EventOutcome::Applied)
    }

    async fn skip(&self, task_id: Uuid) -> SchedulerResult<EventOutcome> {
        let Some(task) = self.tasks.get(task_id).await? else {
            return Ok(rejected(RejectReason::UnknownTask));
        };
        if task.state.is_terminal() {
            return Ok(invalid_state(&task, "skip"));
        }

        let change = StateChange::new(task.id, task.state, TaskState::Skipped);
        let Some(updated) = self.tasks.apply_state_change(&change).await? else {
            return Ok(rejected(RejectReason::Conflict));
        };

        info!("{} 已跳过", updated.entity_description());
        self.after_transition(&updated).await?;
        Ok(EventOutcome::Applied)
    }

    /// 手动重试失败任务，已结束的作业重新进入进行中
    async fn retry(&self, task_id: Uuid) -> SchedulerResult<EventOutcome> {
        let Some(task) = self.tasks.get(task_id).await? else {
            return Ok(rejected(RejectReason::UnknownTask));
        };
        if task.state != TaskState::Failure {
            return Ok(invalid_state(&task, "retry"));
        }

        let change = StateChange::new(task.id, TaskState::Failure, TaskState::Waiting);
        let Some(updated) = self.tasks.apply_state_change(&change).await? else {
            return Ok(rejected(RejectReason::Conflict));
        };

        if let Some(job) = self.jobs.get(updated.job_id).await? {
            if matches!(job.state, JobState::Failed | JobState::Success)
                && self
                    .jobs
                    .set_state(job.id, JobState::InProgress, Some(job.state))
                    .await?
            {
                info!("{} 因任务重试重新开始", job.entity_description());
            }
        }

        info!("{} 重新进入等待", updated.entity_description());
        metrics::record_task_state(TaskState::Waiting);
        Ok(EventOutcome::Applied)
    }

    async fn record_error(
        &self,
        task: &Task,
        endpoint: &str,
        error: &TaskErrorEvent,
    ) -> SchedulerResult<TaskError> {
        let record = TaskError {
            id: Uuid::new_v4(),
            task_id: task.id,
            job_id: task.job_id,
            endpoint: endpoint.to_string(),
            path: error.path.clone(),
            message: error.message.clone(),
            processor: error.processor.clone(),
            fatal: error.fatal,
            phase: error.phase.clone(),
            stack_trace: error.stack_trace.clone(),
            time_created: Utc::now(),
        };
        self.task_errors.create(&record).await
    }

    /// 失败后的记录：重新排队计入重试指标，彻底失败写一条致命错误
    async fn after_failure(
        &self,
        task: &Task,
        decision: Option<RetryDecision>,
        message: &str,
        endpoint: &str,
    ) -> SchedulerResult<()> {
        match decision {
            Some(RetryDecision::Requeue) => {
                metrics::record_retry();
                info!(
                    "{} 失败，重新排队 (已运行 {} 次)",
                    task.entity_description(),
                    task.run_count
                );
            }
            Some(RetryDecision::Fail) => {
                let error = TaskErrorEvent {
                    phase: "dispatch".to_string(),
                    ..TaskErrorEvent::new(message, true)
                };
                self.record_error(task, endpoint, &error).await?;
                warn!(
                    "{} 失败次数已达上限 {}",
                    task.entity_description(),
                    self.retry_policy.max_run_count
                );
            }
            None => {}
        }
        Ok(())
    }

    /// 任务进入新状态后的后续处理：解析依赖并检查作业是否结束
    async fn after_transition(&self, task: &Task) -> SchedulerResult<()> {
        metrics::record_task_state(task.state);
        if !task.state.is_terminal() {
            return Ok(());
        }

        let mut jobs = BTreeSet::from([task.job_id]);
        jobs.extend(self.resolve_dependents(task.id).await?);
        for job_id in jobs {
            self.finish_job_if_done(job_id).await?;
        }
        Ok(())
    }

    /// 依赖结束后更新等待它的任务，失败或跳过会沿依赖链级联跳过
    ///
    /// 返回受影响的作业
    async fn resolve_dependents(&self, task_id: Uuid) -> SchedulerResult<Vec<Uuid>> {
        let mut pending = vec![task_id];
        let mut affected_jobs = Vec::new();

        while let Some(finished) = pending.pop() {
            for dependent in self.tasks.find_dependents(finished).await? {
                let deps = self
                    .tasks
                    .list(&TaskFilter {
                        ids: dependent.depends_on.clone(),
                        ..Default::default()
                    })
                    .await?;
                let states: Vec<(Uuid, TaskState)> =
                    deps.iter().map(|t| (t.id, t.state)).collect();

                let resolution = TaskDependencyService::resolve(&dependent.depends_on, &states);
                if resolution == DependencyResolution::Pending {
                    continue;
                }

                let change =
                    StateChange::new(dependent.id, TaskState::Depend, resolution.task_state());
                let Some(updated) = self.tasks.apply_state_change(&change).await? else {
                    continue;
                };
                debug!(
                    "{} 依赖已结束，状态变为 {}",
                    updated.entity_description(),
                    updated.state
                );
                metrics::record_task_state(updated.state);

                if updated.state == TaskState::Skipped {
                    pending.push(updated.id);
                    affected_jobs.push(updated.job_id);
                }
            }
        }

        Ok(affected_jobs)
    }

    async fn finish_job_if_done(&self, job_id: Uuid) -> SchedulerResult<()> {
        let Some(job) = self.jobs.get(job_id).await? else {
            return Ok(());
        };
        if job.state != JobState::InProgress {
            return Ok(());
        }

        if let Some(final_state) = JobCompletion::evaluate(&job.task_counts) {
            if self
                .jobs
                .set_state(job.id, final_state, Some(JobState::InProgress))
                .await?
            {
                info!("{} 已结束，状态: {}", job.entity_description(), final_state);
                for released in self.jobs.resolve_job_dependents(job.id).await? {
                    info!("作业 {} 的依赖作业已全部结束，开始分发", released);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archivist_domain::entities::{Job, TaskErrorFilter};
    use archivist_infrastructure::RepositorySet;
    use archivist_testing_utils::{JobSpecBuilder, TaskSpecBuilder};

    const HOST: &str = "render-1:5000";

    struct Fixture {
        repos: RepositorySet,
        handler: TaskEventHandler,
    }

    impl Fixture {
        fn new() -> Self {
            let repos = RepositorySet::in_memory();
            let handler = TaskEventHandler::new(
                repos.jobs.clone(),
                repos.tasks.clone(),
                repos.task_errors.clone(),
                RetryPolicy::new(3),
            );
            Self { repos, handler }
        }

        async fn job_with_tasks(&self, names: &[&str]) -> (Job, Vec<Task>) {
            let job = JobSpecBuilder::new().build_job();
            self.repos.jobs.create(&job, &[]).await.unwrap();
            let tasks: Vec<Task> = names
                .iter()
                .map(|n| TaskSpecBuilder::new(n).build_for(&job))
                .collect();
            let tasks = self.repos.tasks.create_batch(&tasks).await.unwrap();
            (job, tasks)
        }

        async fn start(&self, task: &Task) {
            self.repos
                .tasks
                .claim(task.id, HOST, Utc::now())
                .await
                .unwrap()
                .unwrap();
            let outcome = self
                .handler
                .handle(TaskCommand::Event(TaskEvent::started(task.id, task.job_id, HOST)))
                .await
                .unwrap();
            assert_eq!(outcome, EventOutcome::Applied);
        }

        async fn stop(&self, task: &Task, exit_code: i32) -> EventOutcome {
            self.handler
                .handle(TaskCommand::Event(TaskEvent::stopped(
                    task.id,
                    task.job_id,
                    HOST,
                    exit_code,
                )))
                .await
                .unwrap()
        }

        async fn task(&self, id: Uuid) -> Task {
            self.repos.tasks.get(id).await.unwrap().unwrap()
        }

        async fn job(&self, id: Uuid) -> Job {
            self.repos.jobs.get(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_success_finishes_job() {
        let f = Fixture::new();
        let (job, tasks) = f.job_with_tasks(&["a"]).await;
        f.start(&tasks[0]).await;

        let mut event = TaskEvent::stopped(tasks[0].id, job.id, HOST, 0);
        event.kind = TaskEventKind::Stopped {
            exit_code: 0,
            error: None,
            asset_counts: Some(AssetCounts {
                created: 3,
                replaced: 1,
                ..Default::default()
            }),
        };
        let outcome = f.handler.handle(TaskCommand::Event(event)).await.unwrap();
        assert!(outcome.is_applied());

        let job = f.job(job.id).await;
        assert_eq!(job.state, JobState::Success);
        assert_eq!(job.asset_counts.created, 3);
        assert_eq!(job.asset_counts.replaced, 1);
        assert!(job.time_started.is_some());
        assert_eq!(f.task(tasks[0].id).await.exit_status, Some(0));
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let f = Fixture::new();
        let (job, tasks) = f.job_with_tasks(&["a"]).await;
        let task = &tasks[0];

        for attempt in 1..=3 {
            f.start(task).await;
            assert!(f.stop(task, 1).await.is_applied());
            let current = f.task(task.id).await;
            assert_eq!(current.run_count, attempt);
            if attempt < 3 {
                assert_eq!(current.state, TaskState::Waiting);
            } else {
                assert_eq!(current.state, TaskState::Failure);
            }
        }

        let job = f.job(job.id).await;
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.task_counts.failure, 1);

        let errors = f
            .repos
            .task_errors
            .list(&TaskErrorFilter {
                task_id: Some(task.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].fatal);
        assert_eq!(errors[0].message, "Hard task failure, exit 1");
        // 硬失败记录不计入资产计数
        assert_eq!(job.asset_counts.error, 0);
    }

    #[tokio::test]
    async fn test_duplicate_stopped_is_noop() {
        let f = Fixture::new();
        let (job, tasks) = f.job_with_tasks(&["a", "b"]).await;
        f.start(&tasks[0]).await;

        assert!(f.stop(&tasks[0], 0).await.is_applied());
        let outcome = f.stop(&tasks[0], 0).await;
        assert_eq!(
            outcome,
            EventOutcome::Rejected(RejectReason::InvalidState {
                state: TaskState::Success,
                action: "stopped",
            })
        );

        let job = f.job(job.id).await;
        assert_eq!(job.task_counts.success, 1);
        assert_eq!(job.task_counts.waiting, 1);
        assert_eq!(job.state, JobState::InProgress);
    }

    #[tokio::test]
    async fn test_stopped_before_started_rejected() {
        let f = Fixture::new();
        let (_, tasks) = f.job_with_tasks(&["a"]).await;
        f.repos
            .tasks
            .claim(tasks[0].id, HOST, Utc::now())
            .await
            .unwrap();

        assert!(!f.stop(&tasks[0], 0).await.is_applied());
        assert_eq!(f.task(tasks[0].id).await.state, TaskState::Queued);
    }

    #[tokio::test]
    async fn test_rejects_wrong_host_and_job() {
        let f = Fixture::new();
        let (job, tasks) = f.job_with_tasks(&["a"]).await;
        f.repos
            .tasks
            .claim(tasks[0].id, HOST, Utc::now())
            .await
            .unwrap();

        let outcome = f
            .handler
            .handle(TaskCommand::Event(TaskEvent::started(
                tasks[0].id,
                job.id,
                "other:1",
            )))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            EventOutcome::Rejected(RejectReason::HostMismatch {
                holder: Some(HOST.to_string())
            })
        );

        let outcome = f
            .handler
            .handle(TaskCommand::Event(TaskEvent::started(
                tasks[0].id,
                Uuid::new_v4(),
                HOST,
            )))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            EventOutcome::Rejected(RejectReason::JobMismatch { expected: job.id })
        );

        let outcome = f
            .handler
            .handle(TaskCommand::Event(TaskEvent::started(
                Uuid::new_v4(),
                job.id,
                HOST,
            )))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Rejected(RejectReason::UnknownTask));
    }

    #[tokio::test]
    async fn test_expand_adds_waiting_children() {
        let f = Fixture::new();
        let (job, tasks) = f.job_with_tasks(&["parent"]).await;
        f.start(&tasks[0]).await;

        let children = vec![
            TaskSpecBuilder::new("c1").build(),
            TaskSpecBuilder::new("c2").build(),
            TaskSpecBuilder::new("c3").build(),
        ];
        let outcome = f
            .handler
            .handle(TaskCommand::Event(TaskEvent::expand(
                tasks[0].id,
                job.id,
                HOST,
                children,
            )))
            .await
            .unwrap();
        assert!(outcome.is_applied());

        let job = f.job(job.id).await;
        assert_eq!(job.task_counts.waiting, 3);
        assert_eq!(job.task_counts.running, 1);
        assert_eq!(f.task(tasks[0].id).await.state, TaskState::Running);
    }

    #[tokio::test]
    async fn test_error_events_count_assets() {
        let f = Fixture::new();
        let (job, tasks) = f.job_with_tasks(&["a"]).await;

        for fatal in [false, false, true] {
            let error = TaskErrorEvent::new("bad frame", fatal).with_processor("exr");
            let outcome = f
                .handler
                .handle(TaskCommand::Event(TaskEvent::error(
                    tasks[0].id,
                    job.id,
                    HOST,
                    error,
                )))
                .await
                .unwrap();
            assert!(outcome.is_applied());
        }

        let job = f.job(job.id).await;
        assert_eq!(job.asset_counts.warning, 2);
        assert_eq!(job.asset_counts.error, 1);
        assert_eq!(f.task(tasks[0].id).await.state, TaskState::Waiting);
        assert_eq!(f.task(tasks[0].id).await.asset_counts.warning, 2);
    }

    #[tokio::test]
    async fn test_dependency_success_releases_dependent() {
        let f = Fixture::new();
        let job = JobSpecBuilder::new().build_job();
        f.repos.jobs.create(&job, &[]).await.unwrap();
        let parent = TaskSpecBuilder::new("parent").build_for(&job);
        let child = TaskSpecBuilder::new("child")
            .depends_on(parent.id)
            .build_for(&job);
        f.repos
            .tasks
            .create_batch(&[parent.clone(), child.clone()])
            .await
            .unwrap();

        f.start(&parent).await;
        f.stop(&parent, 0).await;

        assert_eq!(f.task(child.id).await.state, TaskState::Waiting);
        assert_eq!(f.job(job.id).await.state, JobState::InProgress);
    }

    #[tokio::test]
    async fn test_dependency_failure_cascades_skip() {
        let f = Fixture::new();
        let job = JobSpecBuilder::new().build_job();
        f.repos.jobs.create(&job, &[]).await.unwrap();
        let a = TaskSpecBuilder::new("a").build_for(&job);
        let b = TaskSpecBuilder::new("b").depends_on(a.id).build_for(&job);
        let c = TaskSpecBuilder::new("c").depends_on(b.id).build_for(&job);
        f.repos
            .tasks
            .create_batch(&[a.clone(), b.clone(), c.clone()])
            .await
            .unwrap();

        let outcome = f.handler.handle(TaskCommand::Skip { task_id: a.id }).await.unwrap();
        assert!(outcome.is_applied());

        assert_eq!(f.task(b.id).await.state, TaskState::Skipped);
        assert_eq!(f.task(c.id).await.state, TaskState::Skipped);
        let job = f.job(job.id).await;
        assert_eq!(job.task_counts.skipped, 3);
        assert_eq!(job.state, JobState::Success);
    }

    #[tokio::test]
    async fn test_expire_applies_retry_policy() {
        let f = Fixture::new();
        let (_, tasks) = f.job_with_tasks(&["a"]).await;
        f.start(&tasks[0]).await;

        let stale_cutoff = Utc::now() - chrono::Duration::seconds(60);
        let outcome = f
            .handler
            .handle(TaskCommand::Expire {
                task_id: tasks[0].id,
                cutoff: stale_cutoff,
            })
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Rejected(RejectReason::Conflict));

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let outcome = f
            .handler
            .handle(TaskCommand::Expire {
                task_id: tasks[0].id,
                cutoff,
            })
            .await
            .unwrap();
        assert!(outcome.is_applied());

        let task = f.task(tasks[0].id).await;
        assert_eq!(task.state, TaskState::Waiting);
        assert_eq!(task.run_count, 1);
        assert!(task.host.is_none());
    }

    #[tokio::test]
    async fn test_manual_retry_reopens_job() {
        let f = Fixture::new();
        let handler = TaskEventHandler::new(
            f.repos.jobs.clone(),
            f.repos.tasks.clone(),
            f.repos.task_errors.clone(),
            RetryPolicy::new(1),
        );
        let (job, tasks) = f.job_with_tasks(&["a"]).await;
        f.repos
            .tasks
            .claim(tasks[0].id, HOST, Utc::now())
            .await
            .unwrap();
        handler
            .handle(TaskCommand::Event(TaskEvent::started(tasks[0].id, job.id, HOST)))
            .await
            .unwrap();
        handler
            .handle(TaskCommand::Event(TaskEvent::stopped(tasks[0].id, job.id, HOST, 2)))
            .await
            .unwrap();
        assert_eq!(f.job(job.id).await.state, JobState::Failed);

        let outcome = handler
            .handle(TaskCommand::Retry { task_id: tasks[0].id })
            .await
            .unwrap();
        assert!(outcome.is_applied());

        let task = f.task(tasks[0].id).await;
        assert_eq!(task.state, TaskState::Waiting);
        assert_eq!(task.run_count, 1);
        assert_eq!(f.job(job.id).await.state, JobState::InProgress);

        let again = handler
            .handle(TaskCommand::Retry { task_id: tasks[0].id })
            .await
            .unwrap();
        assert!(!again.is_applied());
    }
}
