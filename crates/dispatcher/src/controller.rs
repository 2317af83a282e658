//! 调度控制器
//!
//! 对外暴露调度核心的全部操作，并负责启动和停止后台组件：
//! 分发队列、事件处理通道、Analyst失效检测和孤儿任务检测。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use archivist_core::{AppConfig, SchedulerError, SchedulerResult};
use archivist_domain::{
    entities::{
        Analyst, AnalystFilter, DispatchTask, Job, JobFilter, LockState, Task, TaskError,
        TaskErrorFilter, TaskFilter,
    },
    events::{EventOutcome, TaskEvent},
    services::RetryPolicy,
    value_objects::{AnalystPing, JobSpec},
};
use archivist_infrastructure::RepositorySet;

use crate::analyst_reaper::AnalystReaper;
use crate::analyst_registry::AnalystRegistry;
use crate::dispatch_queue::{DispatchQueue, DispatchWorker};
use crate::event_handler::{TaskCommand, TaskEventHandler};
use crate::event_processor::EventProcessor;
use crate::job_service::JobService;
use crate::orphan_detector::OrphanDetector;

pub struct DispatchController {
    repos: RepositorySet,
    registry: AnalystRegistry,
    queue: DispatchQueue,
    events: EventProcessor,
    jobs: JobService,
    reaper: Arc<AnalystReaper>,
    orphans: Arc<OrphanDetector>,
    handles: Vec<JoinHandle<()>>,
}

impl DispatchController {
    /// 启动全部后台组件，`shutdown_rx` 收到信号后它们依次退出
    pub fn start(
        repos: RepositorySet,
        config: &AppConfig,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let dispatcher = &config.dispatcher;
        let mut handles = Vec::new();

        let worker = DispatchWorker::new(
            repos.jobs.clone(),
            repos.tasks.clone(),
            repos.analysts.clone(),
            dispatcher.candidate_batch_size,
        );
        let (queue, handle) = DispatchQueue::start(
            worker,
            dispatcher.event_queue_capacity,
            shutdown_rx.resubscribe(),
        );
        handles.push(handle);

        let handler = Arc::new(TaskEventHandler::new(
            repos.jobs.clone(),
            repos.tasks.clone(),
            repos.task_errors.clone(),
            RetryPolicy::new(dispatcher.max_run_count),
        ));
        let (events, lane_handles) = EventProcessor::start(
            handler,
            dispatcher.event_workers,
            dispatcher.event_queue_capacity,
            shutdown_rx.resubscribe(),
        );
        handles.extend(lane_handles);

        let reaper = Arc::new(AnalystReaper::new(
            repos.analysts.clone(),
            config.analyst.clone(),
        ));
        handles.push(tokio::spawn(
            Arc::clone(&reaper).run(shutdown_rx.resubscribe()),
        ));

        let orphans = Arc::new(OrphanDetector::new(
            repos.tasks.clone(),
            events.clone(),
            dispatcher.run_timeout_seconds,
            Duration::from_secs(dispatcher.orphan_check_interval_seconds),
        ));
        handles.push(tokio::spawn(Arc::clone(&orphans).run(shutdown_rx)));

        info!(
            "调度控制器已启动 (最大运行次数: {}, 事件通道: {})",
            dispatcher.max_run_count,
            events.lane_count()
        );

        Self {
            registry: AnalystRegistry::new(repos.analysts.clone(), repos.tasks.clone()),
            jobs: JobService::new(repos.jobs.clone(), repos.tasks.clone(), events.clone()),
            repos,
            queue,
            events,
            reaper,
            orphans,
            handles,
        }
    }

    pub async fn create_job(&self, spec: &JobSpec) -> SchedulerResult<Job> {
        self.jobs.create_job(spec).await
    }

    pub async fn get_next_task(&self, endpoint: &str) -> SchedulerResult<Option<DispatchTask>> {
        self.queue.get_next(endpoint).await
    }

    pub async fn report_event(&self, event: TaskEvent) -> SchedulerResult<EventOutcome> {
        self.events.submit(TaskCommand::Event(event)).await
    }

    pub async fn heartbeat(&self, ping: &AnalystPing) -> SchedulerResult<Analyst> {
        self.registry.upsert(ping).await
    }

    pub async fn pause_job(&self, job_id: Uuid) -> SchedulerResult<bool> {
        self.jobs.pause_job(job_id).await
    }

    pub async fn resume_job(&self, job_id: Uuid) -> SchedulerResult<bool> {
        self.jobs.resume_job(job_id).await
    }

    pub async fn cancel_job(&self, job_id: Uuid) -> SchedulerResult<()> {
        self.jobs.cancel_job(job_id).await
    }

    pub async fn restart_job(&self, job_id: Uuid) -> SchedulerResult<()> {
        self.jobs.restart_job(job_id).await
    }

    pub async fn retry_task(&self, task_id: Uuid) -> SchedulerResult<EventOutcome> {
        self.events.submit(TaskCommand::Retry { task_id }).await
    }

    pub async fn skip_task(&self, task_id: Uuid) -> SchedulerResult<EventOutcome> {
        self.events.submit(TaskCommand::Skip { task_id }).await
    }

    pub async fn retry_all_failures(&self, job_id: Uuid) -> SchedulerResult<usize> {
        self.jobs.retry_all_failures(job_id).await
    }

    pub async fn get_job(&self, job_id: Uuid) -> SchedulerResult<Job> {
        self.jobs.get_job(job_id).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> SchedulerResult<Task> {
        self.repos
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(task_id))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> SchedulerResult<Vec<Job>> {
        self.repos.jobs.list(filter).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        self.repos.tasks.list(filter).await
    }

    pub async fn get_task_errors(&self, filter: &TaskErrorFilter) -> SchedulerResult<Vec<TaskError>> {
        self.repos.task_errors.list(filter).await
    }

    pub async fn list_analysts(&self, filter: &AnalystFilter) -> SchedulerResult<Vec<Analyst>> {
        self.registry.list(filter).await
    }

    pub async fn get_analyst(&self, endpoint: &str) -> SchedulerResult<Analyst> {
        self.registry
            .get(endpoint)
            .await?
            .ok_or_else(|| SchedulerError::analyst_not_found(endpoint))
    }

    pub async fn analyst_exists(&self, endpoint: &str) -> SchedulerResult<bool> {
        self.registry.exists(endpoint).await
    }

    pub async fn set_analyst_lock(&self, endpoint: &str, lock_state: LockState) -> SchedulerResult<()> {
        self.registry.set_lock_state(endpoint, lock_state).await
    }

    /// 立即执行一次Analyst失效检测，不等待定时器
    pub async fn reap_analysts(&self) -> SchedulerResult<Vec<String>> {
        self.reaper.reap().await
    }

    /// 立即执行一次孤儿任务检测，不等待定时器
    pub async fn check_orphans(&self) -> SchedulerResult<usize> {
        self.orphans.check_orphans().await
    }

    /// 等待全部后台组件退出，需要先发出停止信号
    pub async fn wait_stopped(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("后台组件异常退出: {}", e);
            }
        }
        info!("调度控制器已停止");
    }
}
