//! 内存存储实现
//!
//! 适用于测试和单进程部署。所有仓储共享同一个 `RwLock` 保护的状态，
//! 每个操作在一次写锁内完成，与SQLite实现的事务语义一致。

use std::collections::HashMap;
use std::sync::Arc;

use archivist_core::{SchedulerError, SchedulerResult};
use archivist_domain::{
    entities::{
        Analyst, AnalystFilter, AnalystState, AssetCounts, Job, JobFilter, JobState, LockState,
        Task, TaskError, TaskErrorFilter, TaskFilter, TaskState,
    },
    repositories::{AnalystRepository, JobRepository, TaskErrorRepository, TaskRepository},
    task_dependency_service::TaskDependencyService,
    value_objects::StateChange,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
struct JobDependency {
    job_id: Uuid,
    depends_on_job_id: Uuid,
    resolved: bool,
}

#[derive(Debug)]
struct StoredTask {
    seq: u64,
    task: Task,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    tasks: HashMap<Uuid, StoredTask>,
    /// 被依赖任务 -> 依赖它的任务
    dependents: HashMap<Uuid, Vec<Uuid>>,
    next_seq: u64,
    job_dependencies: Vec<JobDependency>,
    analysts: HashMap<String, Analyst>,
    task_errors: Vec<TaskError>,
}

impl MemoryState {
    /// 按插入顺序返回满足条件的任务
    fn tasks_where<F>(&self, predicate: F) -> Vec<Task>
    where
        F: Fn(&Task) -> bool,
    {
        let mut matched: Vec<&StoredTask> = self
            .tasks
            .values()
            .filter(|stored| predicate(&stored.task))
            .collect();
        matched.sort_by_key(|stored| stored.seq);
        matched.into_iter().map(|stored| stored.task.clone()).collect()
    }

    fn job_accepts_dispatch(&self, job_id: Uuid) -> bool {
        self.jobs
            .get(&job_id)
            .map(Job::is_dispatchable)
            .unwrap_or(false)
    }

    /// 写入一批任务，先整体校验，保证要么全部创建要么都不创建
    ///
    /// 初始状态根据依赖任务的当前状态决定，作业计数随之增加。
    fn insert_tasks(&mut self, tasks: &[Task], now: DateTime<Utc>) -> SchedulerResult<Vec<Task>> {
        for task in tasks {
            if !self.jobs.contains_key(&task.job_id) {
                return Err(SchedulerError::job_not_found(task.job_id));
            }
            TaskDependencyService::validate(task.id, &task.depends_on)
                .map_err(SchedulerError::Validation)?;
        }

        let mut created = Vec::with_capacity(tasks.len());
        for task in tasks {
            let mut task = task.clone();
            task.state = if task.has_dependencies() {
                let states: Vec<(Uuid, TaskState)> = task
                    .depends_on
                    .iter()
                    .filter_map(|id| self.tasks.get(id).map(|s| (*id, s.task.state)))
                    .collect();
                TaskDependencyService::resolve(&task.depends_on, &states).task_state()
            } else {
                TaskState::Waiting
            };
            if task.state.is_terminal() {
                task.time_stopped = Some(now);
            }

            for dep in &task.depends_on {
                let dependents = self.dependents.entry(*dep).or_default();
                if !dependents.contains(&task.id) {
                    dependents.push(task.id);
                }
            }

            let total_only = AssetCounts {
                total: task.asset_counts.total,
                ..Default::default()
            };
            self.apply_job_delta(task.job_id, None, task.state, &total_only, now);

            let seq = self.next_seq;
            self.next_seq += 1;
            self.tasks.insert(
                task.id,
                StoredTask {
                    seq,
                    task: task.clone(),
                },
            );
            created.push(task);
        }
        Ok(created)
    }

    fn apply_job_delta(
        &mut self,
        job_id: Uuid,
        from: Option<TaskState>,
        to: TaskState,
        delta: &AssetCounts,
        at: DateTime<Utc>,
    ) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            match from {
                Some(from) => job.task_counts.transition(from, to),
                None => job.task_counts.adjust(to, 1),
            }
            job.asset_counts.add(delta);
            job.time_updated = at;
        }
    }
}

/// 内存存储，提供四类仓储
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_repository(&self) -> MemoryJobRepository {
        MemoryJobRepository {
            state: self.state.clone(),
        }
    }

    pub fn task_repository(&self) -> MemoryTaskRepository {
        MemoryTaskRepository {
            state: self.state.clone(),
        }
    }

    pub fn analyst_repository(&self) -> MemoryAnalystRepository {
        MemoryAnalystRepository {
            state: self.state.clone(),
        }
    }

    pub fn task_error_repository(&self) -> MemoryTaskErrorRepository {
        MemoryTaskErrorRepository {
            state: self.state.clone(),
        }
    }
}

pub struct MemoryJobRepository {
    state: Arc<RwLock<MemoryState>>,
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn create(&self, job: &Job, tasks: &[Task]) -> SchedulerResult<Job> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.id) {
            return Err(SchedulerError::validation(format!(
                "作业 {} 已存在",
                job.id
            )));
        }

        let mut edges = Vec::with_capacity(job.depend_on_job_ids.len());
        for dep in &job.depend_on_job_ids {
            let Some(target) = state.jobs.get(dep) else {
                return Err(SchedulerError::job_not_found(*dep));
            };
            edges.push(JobDependency {
                job_id: job.id,
                depends_on_job_id: *dep,
                resolved: target.state.is_finished(),
            });
        }

        let mut stored = job.clone();
        stored.job_depend_count = edges.iter().filter(|e| !e.resolved).count() as i64;
        state.jobs.insert(job.id, stored);

        if let Err(e) = state.insert_tasks(tasks, Utc::now()) {
            state.jobs.remove(&job.id);
            return Err(e);
        }
        state.job_dependencies.extend(edges);

        debug!("创建作业成功: {}", job.entity_description());
        state
            .jobs
            .get(&job.id)
            .cloned()
            .ok_or_else(|| SchedulerError::job_not_found(job.id))
    }

    async fn get(&self, id: Uuid) -> SchedulerResult<Option<Job>> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> SchedulerResult<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.time_created);
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn set_state(
        &self,
        id: Uuid,
        new_state: JobState,
        expected: Option<JobState>,
    ) -> SchedulerResult<bool> {
        let mut state = self.state.write().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if expected.map(|e| e != job.state).unwrap_or(false) {
            return Ok(false);
        }
        job.state = new_state;
        job.time_updated = Utc::now();
        debug!("作业 {} 状态更新为 {}", id, new_state);
        Ok(true)
    }

    async fn set_paused(&self, id: Uuid, paused: bool) -> SchedulerResult<bool> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.paused != paused => {
                job.paused = paused;
                job.time_updated = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_started(&self, id: Uuid, at: DateTime<Utc>) -> SchedulerResult<bool> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.time_started.is_none() => {
                job.time_started = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn resolve_job_dependents(&self, job_id: Uuid) -> SchedulerResult<Vec<Uuid>> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        let mut waiting = Vec::new();
        for edge in state
            .job_dependencies
            .iter_mut()
            .filter(|e| e.depends_on_job_id == job_id && !e.resolved)
        {
            edge.resolved = true;
            waiting.push(edge.job_id);
        }

        let mut released = Vec::new();
        for id in waiting {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.job_depend_count -= 1;
                job.time_updated = now;
                if job.job_depend_count == 0 {
                    released.push(id);
                }
            }
        }
        Ok(released)
    }
}

pub struct MemoryTaskRepository {
    state: Arc<RwLock<MemoryState>>,
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn create_batch(&self, tasks: &[Task]) -> SchedulerResult<Vec<Task>> {
        let mut state = self.state.write().await;
        let created = state.insert_tasks(tasks, Utc::now())?;
        debug!("批量创建 {} 个任务", created.len());
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> SchedulerResult<Option<Task>> {
        Ok(self
            .state
            .read()
            .await
            .tasks
            .get(&id)
            .map(|stored| stored.task.clone()))
    }

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        let state = self.state.read().await;
        let mut tasks = state.tasks_where(|task| filter.matches(task));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn dispatch_candidates(&self, limit: usize) -> SchedulerResult<Vec<Task>> {
        let state = self.state.read().await;
        let mut candidates: Vec<(i32, DateTime<Utc>, u64, Task)> = state
            .tasks
            .values()
            .filter(|stored| {
                stored.task.state == TaskState::Waiting
                    && state.job_accepts_dispatch(stored.task.job_id)
            })
            .map(|stored| {
                let priority = state
                    .jobs
                    .get(&stored.task.job_id)
                    .map(|job| job.priority)
                    .unwrap_or_default();
                (priority, stored.task.time_created, stored.seq, stored.task.clone())
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });
        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|(_, _, _, task)| task)
            .collect())
    }

    async fn claim(
        &self,
        task_id: Uuid,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> SchedulerResult<Option<Task>> {
        let mut state = self.state.write().await;

        let job_id = match state.tasks.get(&task_id) {
            Some(stored) if stored.task.state == TaskState::Waiting => stored.task.job_id,
            _ => return Ok(None),
        };
        if !state.job_accepts_dispatch(job_id) {
            return Ok(None);
        }

        let Some(stored) = state.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        stored.task.state = TaskState::Queued;
        stored.task.host = Some(endpoint.to_string());
        stored.task.time_ping = Some(at);
        stored.task.time_modified = at;
        let task = stored.task.clone();

        state.apply_job_delta(
            job_id,
            Some(TaskState::Waiting),
            TaskState::Queued,
            &AssetCounts::default(),
            at,
        );
        Ok(Some(task))
    }

    async fn apply_state_change(&self, change: &StateChange) -> SchedulerResult<Option<Task>> {
        if !change.expected.can_transition_to(change.new_state) {
            return Err(SchedulerError::InvalidState(format!(
                "不允许的任务状态迁移: {} -> {}",
                change.expected, change.new_state
            )));
        }

        let mut state = self.state.write().await;
        let Some(stored) = state.tasks.get_mut(&change.task_id) else {
            return Ok(None);
        };
        let task = &mut stored.task;

        if task.state != change.expected {
            debug!(
                "任务 {} 条件更新未生效: 期望状态 {}，当前 {}",
                change.task_id, change.expected, task.state
            );
            return Ok(None);
        }
        if let Some(host) = &change.expected_host {
            if task.host.as_deref() != Some(host.as_str()) {
                return Ok(None);
            }
        }

        let delta = change.asset_delta.unwrap_or_default();
        task.state = change.new_state;
        task.time_modified = change.at;
        if !change.new_state.holds_host() {
            task.host = None;
        }
        if change.new_state == TaskState::Running {
            task.time_started = Some(change.at);
            task.time_ping = Some(change.at);
        }
        if change.new_state.is_terminal()
            || (change.expected.holds_host() && !change.new_state.holds_host())
        {
            task.time_stopped = Some(change.at);
        }
        if change.increment_run_count {
            task.run_count += 1;
        }
        if let Some(exit_status) = change.exit_status {
            task.exit_status = Some(exit_status);
        }
        task.asset_counts.add(&delta);

        let updated = task.clone();
        state.apply_job_delta(
            updated.job_id,
            Some(change.expected),
            change.new_state,
            &delta,
            change.at,
        );
        Ok(Some(updated))
    }

    async fn update_ping(
        &self,
        task_id: Uuid,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut state = self.state.write().await;
        match state.tasks.get_mut(&task_id) {
            Some(stored)
                if stored.task.state == TaskState::Running && stored.task.is_held_by(endpoint) =>
            {
                stored.task.time_ping = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_asset_counts(
        &self,
        task_id: Uuid,
        delta: &AssetCounts,
    ) -> SchedulerResult<bool> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let Some(stored) = state.tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        stored.task.asset_counts.add(delta);
        stored.task.time_modified = now;
        let job_id = stored.task.job_id;

        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.asset_counts.add(delta);
            job.time_updated = now;
        }
        Ok(true)
    }

    async fn find_orphans(&self, cutoff: DateTime<Utc>) -> SchedulerResult<Vec<Task>> {
        let state = self.state.read().await;
        Ok(state.tasks_where(|task| {
            matches!(task.state, TaskState::Queued | TaskState::Running)
                && task.time_ping.unwrap_or(task.time_modified) < cutoff
        }))
    }

    async fn find_dependents(&self, task_id: Uuid) -> SchedulerResult<Vec<Task>> {
        let state = self.state.read().await;
        let Some(ids) = state.dependents.get(&task_id) else {
            return Ok(Vec::new());
        };
        Ok(state.tasks_where(|task| task.state == TaskState::Depend && ids.contains(&task.id)))
    }
}

pub struct MemoryAnalystRepository {
    state: Arc<RwLock<MemoryState>>,
}

#[async_trait]
impl AnalystRepository for MemoryAnalystRepository {
    async fn upsert(&self, analyst: &Analyst) -> SchedulerResult<Analyst> {
        let mut state = self.state.write().await;
        let stored = match state.analysts.get(&analyst.endpoint) {
            Some(existing) => Analyst {
                state: AnalystState::Up,
                lock_state: existing.lock_state,
                time_created: existing.time_created,
                ..analyst.clone()
            },
            None => Analyst {
                state: AnalystState::Up,
                ..analyst.clone()
            },
        };
        state
            .analysts
            .insert(stored.endpoint.clone(), stored.clone());
        Ok(stored)
    }

    async fn get(&self, endpoint: &str) -> SchedulerResult<Option<Analyst>> {
        Ok(self.state.read().await.analysts.get(endpoint).cloned())
    }

    async fn list(&self, filter: &AnalystFilter) -> SchedulerResult<Vec<Analyst>> {
        let state = self.state.read().await;
        let mut analysts: Vec<Analyst> = state
            .analysts
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        analysts.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        Ok(analysts)
    }

    async fn mark_down_if_silent(
        &self,
        endpoint: &str,
        cutoff: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut state = self.state.write().await;
        match state.analysts.get_mut(endpoint) {
            Some(analyst) if analyst.is_up() && analyst.time_last_ping < cutoff => {
                analyst.state = AnalystState::Down;
                debug!("Analyst {} 状态更新为 DOWN", endpoint);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_lock_state(
        &self,
        endpoint: &str,
        lock_state: LockState,
    ) -> SchedulerResult<bool> {
        let mut state = self.state.write().await;
        match state.analysts.get_mut(endpoint) {
            Some(analyst) => {
                analyst.lock_state = lock_state;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_task_id(&self, endpoint: &str, task_id: Option<Uuid>) -> SchedulerResult<bool> {
        let mut state = self.state.write().await;
        match state.analysts.get_mut(endpoint) {
            Some(analyst) => {
                analyst.current_task_id = task_id;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_if_silent(
        &self,
        endpoint: &str,
        cutoff: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut state = self.state.write().await;
        match state.analysts.get(endpoint) {
            Some(analyst) if !analyst.is_up() && analyst.time_last_ping < cutoff => {
                state.analysts.remove(endpoint);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

pub struct MemoryTaskErrorRepository {
    state: Arc<RwLock<MemoryState>>,
}

#[async_trait]
impl TaskErrorRepository for MemoryTaskErrorRepository {
    async fn create(&self, error: &TaskError) -> SchedulerResult<TaskError> {
        self.state.write().await.task_errors.push(error.clone());
        Ok(error.clone())
    }

    async fn list(&self, filter: &TaskErrorFilter) -> SchedulerResult<Vec<TaskError>> {
        let state = self.state.read().await;
        let errors = state
            .task_errors
            .iter()
            .filter(|e| filter.matches(e))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archivist_domain::value_objects::{AnalystPing, JobSpec, TaskSpec};

    async fn setup() -> (InMemoryStore, Job) {
        let store = InMemoryStore::new();
        let job = Job::new(&JobSpec::new("job", Uuid::new_v4()));
        store.job_repository().create(&job, &[]).await.unwrap();
        (store, job)
    }

    fn task_for(job: &Job, name: &str) -> Task {
        Task::new(job, &TaskSpec::new(name, serde_json::json!({})))
    }

    #[tokio::test]
    async fn test_create_batch_is_atomic() {
        let (store, job) = setup().await;
        let repo = store.task_repository();
        let other = Job::new(&JobSpec::new("missing", Uuid::new_v4()));

        let err = repo
            .create_batch(&[task_for(&job, "a"), task_for(&other, "b")])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(repo.list(&TaskFilter::default()).await.unwrap().is_empty());

        let job = store.job_repository().get(job.id).await.unwrap().unwrap();
        assert_eq!(job.task_counts.total(), 0);
    }

    #[tokio::test]
    async fn test_dependency_initial_states() {
        let (store, job) = setup().await;
        let repo = store.task_repository();

        let parent = task_for(&job, "parent");
        repo.create_batch(&[parent.clone()]).await.unwrap();
        repo.claim(parent.id, "h:1", Utc::now()).await.unwrap();
        repo.apply_state_change(
            &StateChange::new(parent.id, TaskState::Queued, TaskState::Failure).with_host("h:1"),
        )
        .await
        .unwrap()
        .unwrap();

        let child = Task::new(
            &job,
            &TaskSpec::new("child", serde_json::json!({})).depends_on(parent.id),
        );
        let created = repo.create_batch(&[child]).await.unwrap();
        assert_eq!(created[0].state, TaskState::Skipped);
        assert!(created[0].time_stopped.is_some());

        let job = store.job_repository().get(job.id).await.unwrap().unwrap();
        assert_eq!(job.task_counts.skipped, 1);
        assert_eq!(job.task_counts.failure, 1);
    }

    #[tokio::test]
    async fn test_claim_respects_paused_job() {
        let (store, job) = setup().await;
        let repo = store.task_repository();
        let task = task_for(&job, "a");
        repo.create_batch(&[task.clone()]).await.unwrap();

        store.job_repository().set_paused(job.id, true).await.unwrap();
        assert!(repo.dispatch_candidates(5).await.unwrap().is_empty());
        assert!(repo.claim(task.id, "h:1", Utc::now()).await.unwrap().is_none());

        store.job_repository().set_paused(job.id, false).await.unwrap();
        let claimed = repo.claim(task.id, "h:1", Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.state, TaskState::Queued);
        assert!(repo.claim(task.id, "h:2", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_change_requires_host() {
        let (store, job) = setup().await;
        let repo = store.task_repository();
        let task = task_for(&job, "a");
        repo.create_batch(&[task.clone()]).await.unwrap();
        repo.claim(task.id, "h:1", Utc::now()).await.unwrap();

        let change =
            StateChange::new(task.id, TaskState::Queued, TaskState::Running).with_host("h:2");
        assert!(repo.apply_state_change(&change).await.unwrap().is_none());

        let change = StateChange::new(task.id, TaskState::Queued, TaskState::Running)
            .with_host("h:1");
        let running = repo.apply_state_change(&change).await.unwrap().unwrap();
        assert!(running.time_started.is_some());

        // 重复应用同一个迁移不会生效
        assert!(repo.apply_state_change(&change).await.unwrap().is_none());

        let requeue = StateChange::new(task.id, TaskState::Running, TaskState::Waiting)
            .with_host("h:1")
            .with_run_increment();
        let requeued = repo.apply_state_change(&requeue).await.unwrap().unwrap();
        assert_eq!(requeued.run_count, 1);
        assert!(requeued.host.is_none());

        let job = store.job_repository().get(job.id).await.unwrap().unwrap();
        assert_eq!(job.task_counts.waiting, 1);
        assert_eq!(job.task_counts.total(), 1);
    }

    #[tokio::test]
    async fn test_find_dependents_only_depend_state() {
        let (store, job) = setup().await;
        let repo = store.task_repository();
        let parent = task_for(&job, "parent");
        let child = Task::new(
            &job,
            &TaskSpec::new("child", serde_json::json!({})).depends_on(parent.id),
        );
        repo.create_batch(&[parent.clone(), child.clone()])
            .await
            .unwrap();

        assert_eq!(repo.find_dependents(parent.id).await.unwrap().len(), 1);

        repo.apply_state_change(&StateChange::new(
            child.id,
            TaskState::Depend,
            TaskState::Waiting,
        ))
        .await
        .unwrap();
        assert!(repo.find_dependents(parent.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_analyst_upsert_keeps_lock() {
        let store = InMemoryStore::new();
        let repo = store.analyst_repository();
        let ping = AnalystPing::new("10.0.0.1", 7000);
        let analyst = Analyst::from_ping(ping.endpoint(), &ping, Utc::now());

        repo.upsert(&analyst).await.unwrap();
        repo.set_lock_state(&analyst.endpoint, LockState::Locked)
            .await
            .unwrap();
        let future = Utc::now() + chrono::Duration::seconds(60);
        assert!(repo
            .mark_down_if_silent(&analyst.endpoint, future)
            .await
            .unwrap());

        let again = repo.upsert(&analyst).await.unwrap();
        assert!(again.is_up());
        assert!(again.is_locked());
    }

    #[tokio::test]
    async fn test_asset_increment_reaches_job() {
        let (store, job) = setup().await;
        let repo = store.task_repository();
        let task = task_for(&job, "a");
        repo.create_batch(&[task.clone()]).await.unwrap();

        assert!(repo
            .increment_asset_counts(task.id, &AssetCounts::errors(1))
            .await
            .unwrap());
        let job = store.job_repository().get(job.id).await.unwrap().unwrap();
        assert_eq!(job.asset_counts.error, 1);
    }
}
