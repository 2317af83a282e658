use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use archivist_core::SchedulerResult;
use archivist_domain::repositories::TaskRepository;

use crate::event_handler::TaskCommand;
use crate::event_processor::EventProcessor;

/// 孤儿任务检测
///
/// 已分发但长时间没有心跳的任务视为孤儿。检测本身只负责发现，
/// 实际的重新排队或失败经由事件通道执行，与同一任务的其它事件串行。
pub struct OrphanDetector {
    tasks: Arc<dyn TaskRepository>,
    events: EventProcessor,
    run_timeout_seconds: i64,
    interval: Duration,
}

impl OrphanDetector {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        events: EventProcessor,
        run_timeout_seconds: i64,
        interval: Duration,
    ) -> Self {
        Self {
            tasks,
            events,
            run_timeout_seconds,
            interval,
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::seconds(self.run_timeout_seconds)
    }

    /// 检测一次，返回被处理的孤儿任务数
    pub async fn check_orphans(&self) -> SchedulerResult<usize> {
        let cutoff = self.cutoff(Utc::now());
        let orphans = self.tasks.find_orphans(cutoff).await?;
        if orphans.is_empty() {
            return Ok(0);
        }

        debug!("发现 {} 个疑似孤儿任务", orphans.len());
        let mut expired = 0;
        for task in orphans {
            let outcome = self
                .events
                .submit(TaskCommand::Expire {
                    task_id: task.id,
                    cutoff,
                })
                .await?;
            if outcome.is_applied() {
                expired += 1;
            }
        }

        if expired > 0 {
            warn!("处理了 {} 个心跳超时的任务", expired);
        }
        Ok(expired)
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "启动孤儿任务检测循环，超时时间: {}秒",
            self.run_timeout_seconds
        );
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("收到停止信号，退出孤儿任务检测循环");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.check_orphans().await {
                        error!("孤儿任务检测时出错: {}", e);
                    }
                }
            }
        }
    }
}
