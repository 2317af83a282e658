use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use archivist_core::{AnalystConfig, SchedulerResult};
use archivist_domain::{
    entities::{Analyst, AnalystFilter, AnalystState},
    repositories::AnalystRepository,
};

use crate::metrics;

/// Analyst失效检测
///
/// 定时把心跳超时的Analyst标记为Down，并按配置清理长期离线的记录。
/// 不处理任务，任务超时由孤儿任务检测负责。
pub struct AnalystReaper {
    analysts: Arc<dyn AnalystRepository>,
    config: AnalystConfig,
}

impl AnalystReaper {
    pub fn new(analysts: Arc<dyn AnalystRepository>, config: AnalystConfig) -> Self {
        Self { analysts, config }
    }

    fn is_analyst_dead(&self, analyst: &Analyst, now: DateTime<Utc>) -> bool {
        analyst.is_up() && analyst.is_heartbeat_expired(now, self.config.liveness_timeout_seconds)
    }

    fn should_cleanup(&self, analyst: &Analyst, now: DateTime<Utc>) -> bool {
        analyst.state == AnalystState::Down
            && analyst.is_heartbeat_expired(now, self.config.cleanup_threshold_seconds)
    }

    /// 标记失效的Analyst，返回本次被标记的endpoint
    ///
    /// 列表只用于挑选候选，真正的标记是带心跳截止时间的条件更新，
    /// 读取之后才到达的心跳不会被覆盖。
    pub async fn reap(&self) -> SchedulerResult<Vec<String>> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(self.config.liveness_timeout_seconds);
        let up = self
            .analysts
            .list(&AnalystFilter {
                state: Some(AnalystState::Up),
                ..Default::default()
            })
            .await?;

        let mut reaped = Vec::new();
        for analyst in up.iter().filter(|a| self.is_analyst_dead(a, now)) {
            if self
                .analysts
                .mark_down_if_silent(&analyst.endpoint, cutoff)
                .await?
            {
                warn!(
                    "Analyst {} 心跳超时 (上次心跳: {})，标记为Down",
                    analyst.endpoint,
                    analyst.time_last_ping.format("%Y-%m-%d %H:%M:%S UTC")
                );
                reaped.push(analyst.endpoint.clone());
            }
        }

        if !reaped.is_empty() {
            metrics::record_analyst_down(reaped.len() as u64);
        }
        Ok(reaped)
    }

    /// 删除长期离线的Analyst
    pub async fn cleanup_offline(&self) -> SchedulerResult<u64> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(self.config.cleanup_threshold_seconds);
        let down = self
            .analysts
            .list(&AnalystFilter {
                state: Some(AnalystState::Down),
                ..Default::default()
            })
            .await?;

        let mut cleaned = 0;
        for analyst in down.iter().filter(|a| self.should_cleanup(a, now)) {
            if self
                .analysts
                .delete_if_silent(&analyst.endpoint, cutoff)
                .await?
            {
                debug!("清理离线Analyst: {}", analyst.endpoint);
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("启动Analyst失效检测循环");
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.reap_interval_seconds));

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("收到停止信号，退出Analyst失效检测循环");
                    break;
                }
                _ = interval.tick() => {
                    match self.reap().await {
                        Ok(reaped) if !reaped.is_empty() => {
                            info!("检测到 {} 个失效的Analyst", reaped.len());
                        }
                        Ok(_) => {}
                        Err(e) => error!("Analyst失效检测时出错: {}", e),
                    }

                    if self.config.auto_cleanup {
                        match self.cleanup_offline().await {
                            Ok(cleaned) if cleaned > 0 => info!("清理了 {} 个离线Analyst", cleaned),
                            Ok(_) => {}
                            Err(e) => error!("清理离线Analyst时出错: {}", e),
                        }
                    }
                }
            }
        }
    }
}
