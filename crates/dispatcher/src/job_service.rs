//! 作业管理
//!
//! 作业的创建与生命周期操作。单个任务的修改都经由事件通道执行，
//! 这里只直接修改作业本身的状态。

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use archivist_core::{SchedulerError, SchedulerResult};
use archivist_domain::{
    entities::{Job, JobState, TaskFilter, TaskState},
    repositories::{JobRepository, TaskRepository},
    task_dependency_service::TaskDependencyService,
    value_objects::JobSpec,
};

use crate::event_handler::TaskCommand;
use crate::event_processor::EventProcessor;

#[derive(Clone)]
pub struct JobService {
    jobs: Arc<dyn JobRepository>,
    tasks: Arc<dyn TaskRepository>,
    events: EventProcessor,
}

impl JobService {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        tasks: Arc<dyn TaskRepository>,
        events: EventProcessor,
    ) -> Self {
        Self {
            jobs,
            tasks,
            events,
        }
    }

    fn validate_spec(spec: &JobSpec) -> SchedulerResult<()> {
        if spec.name.trim().is_empty() {
            return Err(SchedulerError::validation("作业名称不能为空"));
        }
        if spec.tasks.is_empty() {
            return Err(SchedulerError::validation("作业至少需要一个任务"));
        }
        if matches!(spec.max_running_tasks, Some(max) if max <= 0) {
            return Err(SchedulerError::validation("max_running_tasks 必须大于0"));
        }
        spec.tasks
            .iter()
            .try_for_each(|task| task.validate())
            .map_err(SchedulerError::Validation)
    }

    /// 创建作业及其全部任务，返回带最新计数的作业
    ///
    /// 作业、任务和作业间依赖一次写入，失败时不会留下没有任务的作业。
    pub async fn create_job(&self, spec: &JobSpec) -> SchedulerResult<Job> {
        Self::validate_spec(spec)?;

        let job = Job::new(spec);
        let tasks = TaskDependencyService::build_tasks(&job, &spec.tasks);
        let job = self.jobs.create(&job, &tasks).await?;

        info!(
            "创建{}，包含 {} 个任务",
            job.entity_description(),
            job.task_counts.total()
        );
        if job.job_depend_count > 0 {
            info!(
                "{} 等待 {} 个依赖作业结束",
                job.entity_description(),
                job.job_depend_count
            );
        }
        Ok(job)
    }

    pub async fn get_job(&self, job_id: Uuid) -> SchedulerResult<Job> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(job_id))
    }

    /// 暂停后不再分发新任务，已分发的任务继续运行
    pub async fn pause_job(&self, job_id: Uuid) -> SchedulerResult<bool> {
        let job = self.get_job(job_id).await?;
        let changed = self.jobs.set_paused(job.id, true).await?;
        if changed {
            info!("暂停{}", job.entity_description());
        }
        Ok(changed)
    }

    pub async fn resume_job(&self, job_id: Uuid) -> SchedulerResult<bool> {
        let job = self.get_job(job_id).await?;
        let changed = self.jobs.set_paused(job.id, false).await?;
        if changed {
            info!("恢复{}", job.entity_description());
        }
        Ok(changed)
    }

    /// 取消进行中的作业，已分发的任务不会被中断
    pub async fn cancel_job(&self, job_id: Uuid) -> SchedulerResult<()> {
        let job = self.get_job(job_id).await?;
        if !self
            .jobs
            .set_state(job.id, JobState::Cancelled, Some(JobState::InProgress))
            .await?
        {
            return Err(SchedulerError::InvalidState(format!(
                "{} 当前状态为 {}，无法取消",
                job.entity_description(),
                job.state
            )));
        }
        info!("取消{}", job.entity_description());
        Ok(())
    }

    pub async fn restart_job(&self, job_id: Uuid) -> SchedulerResult<()> {
        let job = self.get_job(job_id).await?;
        if !self
            .jobs
            .set_state(job.id, JobState::InProgress, Some(JobState::Cancelled))
            .await?
        {
            return Err(SchedulerError::InvalidState(format!(
                "{} 当前状态为 {}，只有已取消的作业可以重新开始",
                job.entity_description(),
                job.state
            )));
        }
        info!("重新开始{}", job.entity_description());
        Ok(())
    }

    /// 重试作业中所有失败的任务，返回实际重试的数量
    pub async fn retry_all_failures(&self, job_id: Uuid) -> SchedulerResult<usize> {
        let job = self.get_job(job_id).await?;
        let failed = self
            .tasks
            .list(&TaskFilter::for_job(job.id).with_states(&[TaskState::Failure]))
            .await?;

        let mut retried = 0;
        for task in failed {
            let outcome = self.events.submit(TaskCommand::Retry { task_id: task.id }).await?;
            if outcome.is_applied() {
                retried += 1;
            } else {
                warn!("重试{} 未生效", task.entity_description());
            }
        }

        info!("{} 重试了 {} 个失败任务", job.entity_description(), retried);
        Ok(retried)
    }
}
