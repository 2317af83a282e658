//! 事件处理通道
//!
//! 按任务ID哈希到固定的处理通道，同一任务的命令总是按提交顺序串行执行，
//! 不同任务的命令在多个通道间并行。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use archivist_core::{SchedulerError, SchedulerResult};
use archivist_domain::events::EventOutcome;

use crate::event_handler::{TaskCommand, TaskEventHandler};

struct Envelope {
    command: TaskCommand,
    reply: oneshot::Sender<SchedulerResult<EventOutcome>>,
}

#[derive(Clone)]
pub struct EventProcessor {
    lanes: Vec<mpsc::Sender<Envelope>>,
}

impl EventProcessor {
    /// 启动 `workers` 个处理通道，每个通道容量为 `capacity`
    pub fn start(
        handler: Arc<TaskEventHandler>,
        workers: usize,
        capacity: usize,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let workers = workers.max(1);
        let mut lanes = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for lane in 0..workers {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            lanes.push(tx);
            handles.push(tokio::spawn(run_lane(
                lane,
                Arc::clone(&handler),
                rx,
                shutdown_rx.resubscribe(),
            )));
        }

        info!("事件处理器已启动，通道数: {}", workers);
        (Self { lanes }, handles)
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    fn lane_for(&self, task_id: Uuid) -> usize {
        let mut hasher = DefaultHasher::new();
        task_id.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    /// 提交命令并等待处理结果
    ///
    /// 通道已满时等待空位，事件不会被丢弃。
    pub async fn submit(&self, command: TaskCommand) -> SchedulerResult<EventOutcome> {
        let lane = self.lane_for(command.task_id());
        let (reply, rx) = oneshot::channel();

        self.lanes[lane]
            .send(Envelope { command, reply })
            .await
            .map_err(|_| SchedulerError::ChannelClosed(format!("事件通道 {lane} 已停止")))?;

        rx.await
            .map_err(|_| SchedulerError::ChannelClosed(format!("事件通道 {lane} 未返回结果")))?
    }
}

async fn run_lane(
    lane: usize,
    handler: Arc<TaskEventHandler>,
    mut rx: mpsc::Receiver<Envelope>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("事件通道 {} 收到停止信号", lane);
                break;
            }
            envelope = rx.recv() => {
                let Some(Envelope { command, reply }) = envelope else {
                    break;
                };
                let task_id = command.task_id();
                let result = handler.handle(command).await;
                if let Err(e) = &result {
                    error!("处理任务 {} 的命令失败: {}", task_id, e);
                }
                let _ = reply.send(result);
            }
        }
    }
    debug!("事件通道 {} 已退出", lane);
}
