use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use archivist_core::{SchedulerError, SchedulerResult};
use archivist_domain::{
    entities::{Analyst, AnalystFilter, LockState},
    repositories::{AnalystRepository, TaskRepository},
    value_objects::AnalystPing,
};

/// Analyst成员与存活状态
///
/// 心跳只写Analyst记录，唯一会碰到任务的是刷新该Analyst正在运行任务的心跳时间。
#[derive(Clone)]
pub struct AnalystRegistry {
    analysts: Arc<dyn AnalystRepository>,
    tasks: Arc<dyn TaskRepository>,
}

impl AnalystRegistry {
    pub fn new(analysts: Arc<dyn AnalystRepository>, tasks: Arc<dyn TaskRepository>) -> Self {
        Self { analysts, tasks }
    }

    /// 处理一次心跳
    pub async fn upsert(&self, ping: &AnalystPing) -> SchedulerResult<Analyst> {
        if ping.port == 0 {
            return Err(SchedulerError::validation("Analyst端口不能为0"));
        }
        let endpoint = ping.endpoint();
        if endpoint.starts_with(':') {
            return Err(SchedulerError::validation("无法确定Analyst地址"));
        }

        let now = Utc::now();
        let analyst = self
            .analysts
            .upsert(&Analyst::from_ping(endpoint.clone(), ping, now))
            .await?;

        if let Some(task_id) = ping.task_id {
            let refreshed = self.tasks.update_ping(task_id, &endpoint, now).await?;
            if !refreshed {
                debug!("Analyst {} 上报的任务 {} 不在运行中", endpoint, task_id);
            }
        }

        debug!("收到Analyst心跳: {}", endpoint);
        Ok(analyst)
    }

    pub async fn exists(&self, endpoint: &str) -> SchedulerResult<bool> {
        Ok(self.analysts.get(endpoint).await?.is_some())
    }

    pub async fn get(&self, endpoint: &str) -> SchedulerResult<Option<Analyst>> {
        self.analysts.get(endpoint).await
    }

    pub async fn list(&self, filter: &AnalystFilter) -> SchedulerResult<Vec<Analyst>> {
        self.analysts.list(filter).await
    }

    pub async fn set_lock_state(&self, endpoint: &str, lock_state: LockState) -> SchedulerResult<()> {
        if !self.analysts.set_lock_state(endpoint, lock_state).await? {
            return Err(SchedulerError::analyst_not_found(endpoint));
        }
        info!("Analyst {} 锁定状态更新为 {}", endpoint, lock_state.as_str());
        Ok(())
    }
}
