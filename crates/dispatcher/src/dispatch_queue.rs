//! 分发队列
//!
//! 所有认领请求通过一个mpsc通道交给单个actor顺序处理，认领本身也是
//! 存储层的条件更新，与管理操作并发时不会覆盖对方的修改。

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use archivist_core::{SchedulerError, SchedulerResult};
use archivist_domain::{
    entities::DispatchTask,
    repositories::{AnalystRepository, JobRepository, TaskRepository},
};

use crate::metrics;

struct ClaimRequest {
    endpoint: String,
    reply: oneshot::Sender<SchedulerResult<Option<DispatchTask>>>,
}

/// 分发队列句柄
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<ClaimRequest>,
}

impl DispatchQueue {
    /// 启动认领actor
    pub fn start(
        worker: DispatchWorker,
        capacity: usize,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(worker.run(rx, shutdown_rx));
        (Self { tx }, handle)
    }

    /// 为Analyst取下一个任务，没有可分发的任务时返回 `None`
    pub async fn get_next(&self, endpoint: &str) -> SchedulerResult<Option<DispatchTask>> {
        metrics::record_dispatch_request();

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ClaimRequest {
                endpoint: endpoint.to_string(),
                reply,
            })
            .await
            .map_err(|_| SchedulerError::ChannelClosed("分发队列已停止".to_string()))?;

        rx.await
            .map_err(|_| SchedulerError::ChannelClosed("分发队列未返回结果".to_string()))?
    }
}

/// 实际执行认领的actor
pub struct DispatchWorker {
    jobs: Arc<dyn JobRepository>,
    tasks: Arc<dyn TaskRepository>,
    analysts: Arc<dyn AnalystRepository>,
    batch_size: usize,
}

impl DispatchWorker {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        tasks: Arc<dyn TaskRepository>,
        analysts: Arc<dyn AnalystRepository>,
        batch_size: usize,
    ) -> Self {
        Self {
            jobs,
            tasks,
            analysts,
            batch_size: batch_size.max(1),
        }
    }

    async fn run(
        self,
        mut rx: mpsc::Receiver<ClaimRequest>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!("分发队列已启动");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("收到停止信号，分发队列退出");
                    break;
                }
                request = rx.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    let result = self.claim_next(&request.endpoint).await;
                    if let Err(e) = &result {
                        error!("为 {} 分发任务失败: {}", request.endpoint, e);
                    }
                    // 请求方可能已经放弃等待
                    let _ = request.reply.send(result);
                }
            }
        }
    }

    /// 按优先级认领下一个任务
    pub async fn claim_next(&self, endpoint: &str) -> SchedulerResult<Option<DispatchTask>> {
        if let Some(analyst) = self.analysts.get(endpoint).await? {
            if !analyst.can_accept_task() {
                debug!("Analyst {} 已锁定或离线，不分发任务", endpoint);
                return Ok(None);
            }
        }

        let candidates = self.tasks.dispatch_candidates(self.batch_size).await?;
        for candidate in candidates {
            let Some(task) = self.tasks.claim(candidate.id, endpoint, Utc::now()).await? else {
                continue;
            };
            let job = self
                .jobs
                .get(task.job_id)
                .await?
                .ok_or_else(|| SchedulerError::job_not_found(task.job_id))?;

            self.analysts.set_task_id(endpoint, Some(task.id)).await?;
            metrics::record_claim();
            info!("{} 分发给 {}", task.entity_description(), endpoint);
            return Ok(Some(DispatchTask::new(&task, &job)));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archivist_domain::entities::{LockState, TaskState};
    use archivist_infrastructure::RepositorySet;
    use archivist_testing_utils::{AnalystBuilder, JobSpecBuilder, TaskSpecBuilder};

    fn worker(repos: &RepositorySet) -> DispatchWorker {
        DispatchWorker::new(
            repos.jobs.clone(),
            repos.tasks.clone(),
            repos.analysts.clone(),
            10,
        )
    }

    #[tokio::test]
    async fn test_claim_carries_job_env() {
        let repos = RepositorySet::in_memory();
        let job = JobSpecBuilder::new()
            .with_env("LANG", "C")
            .with_arg("quality", serde_json::json!("high"))
            .build_job();
        repos.jobs.create(&job, &[]).await.unwrap();
        let task = TaskSpecBuilder::new("a").build_for(&job);
        repos.tasks.create_batch(&[task.clone()]).await.unwrap();

        let dispatched = worker(&repos).claim_next("h:1").await.unwrap().unwrap();
        assert_eq!(dispatched.task_id, task.id);
        assert_eq!(dispatched.env.get("LANG").map(String::as_str), Some("C"));
        assert_eq!(
            dispatched.env.get(DispatchTask::ENV_TASK_ID),
            Some(&task.id.to_string())
        );
        assert_eq!(dispatched.args["quality"], "high");

        let stored = repos.tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Queued);
        assert!(worker(&repos).claim_next("h:2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_locked_analyst_gets_nothing() {
        let repos = RepositorySet::in_memory();
        let job = JobSpecBuilder::new().build_job();
        repos.jobs.create(&job, &[]).await.unwrap();
        repos
            .tasks
            .create_batch(&[TaskSpecBuilder::new("a").build_for(&job)])
            .await
            .unwrap();

        let analyst = AnalystBuilder::new("render").build();
        repos.analysts.upsert(&analyst).await.unwrap();
        repos
            .analysts
            .set_lock_state(&analyst.endpoint, LockState::Locked)
            .await
            .unwrap();

        assert!(worker(&repos)
            .claim_next(&analyst.endpoint)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_queue_records_analyst_task() {
        let repos = RepositorySet::in_memory();
        let job = JobSpecBuilder::new().build_job();
        repos.jobs.create(&job, &[]).await.unwrap();
        let task = TaskSpecBuilder::new("a").build_for(&job);
        repos.tasks.create_batch(&[task.clone()]).await.unwrap();
        let analyst = AnalystBuilder::new("render").build();
        repos.analysts.upsert(&analyst).await.unwrap();

        let (_tx, shutdown_rx) = broadcast::channel(1);
        let (queue, _handle) = DispatchQueue::start(worker(&repos), 16, shutdown_rx);

        let dispatched = queue.get_next(&analyst.endpoint).await.unwrap().unwrap();
        assert_eq!(dispatched.task_id, task.id);
        let analyst = repos.analysts.get(&analyst.endpoint).await.unwrap().unwrap();
        assert_eq!(analyst.current_task_id, Some(task.id));

        assert!(queue.get_next("render:5000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stopped_queue_reports_channel_closed() {
        let repos = RepositorySet::in_memory();
        let (tx, shutdown_rx) = broadcast::channel(1);
        let (queue, handle) = DispatchQueue::start(worker(&repos), 16, shutdown_rx);

        tx.send(()).unwrap();
        handle.await.unwrap();

        let err = queue.get_next("h:1").await.unwrap_err();
        assert!(matches!(err, SchedulerError::ChannelClosed(_)));
    }
}
