use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// 任务最多运行次数，达到后失败不再自动重试
    pub max_run_count: i32,
    /// 每次分发从存储中取出的候选任务数
    pub candidate_batch_size: usize,
    /// 事件处理通道数，同一任务的事件总是落到同一通道
    pub event_workers: usize,
    pub event_queue_capacity: usize,
    /// 任务超过此时间没有心跳则视为孤儿任务
    pub run_timeout_seconds: i64,
    pub orphan_check_interval_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_run_count: 3,
            candidate_batch_size: 10,
            event_workers: 8,
            event_queue_capacity: 1024,
            run_timeout_seconds: 300,
            orphan_check_interval_seconds: 30,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_run_count <= 0 {
            return Err(anyhow::anyhow!("最大运行次数必须大于0"));
        }

        if self.candidate_batch_size == 0 {
            return Err(anyhow::anyhow!("候选任务批量大小必须大于0"));
        }

        if self.event_workers == 0 {
            return Err(anyhow::anyhow!("事件处理通道数必须大于0"));
        }

        if self.event_queue_capacity == 0 {
            return Err(anyhow::anyhow!("事件队列容量必须大于0"));
        }

        if self.run_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("任务运行超时时间必须大于0"));
        }

        if self.orphan_check_interval_seconds == 0 {
            return Err(anyhow::anyhow!("孤儿任务检测间隔必须大于0"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalystConfig {
    /// 心跳超时时间（秒）
    pub liveness_timeout_seconds: i64,
    /// 检测间隔（秒）
    pub reap_interval_seconds: u64,
    /// 是否自动清理长期离线的Analyst
    pub auto_cleanup: bool,
    /// 离线Analyst清理阈值（秒）
    pub cleanup_threshold_seconds: i64,
}

impl Default for AnalystConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_seconds: 90,
            reap_interval_seconds: 30,
            auto_cleanup: true,
            cleanup_threshold_seconds: 3600,
        }
    }
}

impl AnalystConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.liveness_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("Analyst心跳超时时间必须大于0"));
        }

        if self.reap_interval_seconds == 0 {
            return Err(anyhow::anyhow!("Analyst检测间隔必须大于0"));
        }

        if self.auto_cleanup && self.cleanup_threshold_seconds < self.liveness_timeout_seconds {
            return Err(anyhow::anyhow!("离线清理阈值不能小于心跳超时时间"));
        }

        Ok(())
    }
}
