use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{AssetCounts, TaskState};

/// 创建作业的请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub project_id: Uuid,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub args: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub max_running_tasks: Option<i64>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    /// 这些作业全部结束后才开始分发本作业的任务
    #[serde(default)]
    pub depend_on_job_ids: Vec<Uuid>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, project_id: Uuid) -> Self {
        Self {
            name: name.into(),
            project_id,
            priority: 0,
            paused: false,
            args: HashMap::new(),
            env: HashMap::new(),
            max_running_tasks: None,
            tasks: Vec::new(),
            depend_on_job_ids: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_running_tasks(mut self, max: i64) -> Self {
        self.max_running_tasks = Some(max);
        self
    }

    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn depends_on_job(mut self, job_id: Uuid) -> Self {
        self.depend_on_job_ids.push(job_id);
        self
    }
}

/// 任务描述，用于作业创建和任务扩展
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub script: serde_json::Value,
    /// 已存在任务的ID
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    /// 子任务在父任务之后创建，并依赖父任务
    #[serde(default)]
    pub children: Vec<TaskSpec>,
    #[serde(default)]
    pub asset_ids: Vec<String>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, script: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            script,
            depends_on: Vec::new(),
            children: Vec::new(),
            asset_ids: Vec::new(),
        }
    }

    pub fn depends_on(mut self, task_id: Uuid) -> Self {
        self.depends_on.push(task_id);
        self
    }

    pub fn with_child(mut self, child: TaskSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_assets<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.asset_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("任务名称不能为空".to_string());
        }
        self.children.iter().try_for_each(TaskSpec::validate)
    }
}

/// Analyst心跳
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalystPing {
    /// 显式指定的主机名，优先于网络地址
    #[serde(default)]
    pub hostname: Option<String>,
    pub remote_addr: String,
    pub port: u16,
    #[serde(default)]
    pub total_ram: i64,
    #[serde(default)]
    pub free_ram: i64,
    #[serde(default)]
    pub free_disk: i64,
    #[serde(default)]
    pub load: f64,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub task_id: Option<Uuid>,
}

impl AnalystPing {
    pub fn new(remote_addr: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: None,
            remote_addr: remote_addr.into(),
            port,
            total_ram: 0,
            free_ram: 0,
            free_disk: 0,
            load: 0.0,
            version: String::new(),
            task_id: None,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn endpoint(&self) -> String {
        match self.hostname.as_deref().filter(|h| !h.is_empty()) {
            Some(host) => format!("{}:{}", host, self.port),
            None => format!("{}:{}", self.remote_addr, self.port),
        }
    }
}

/// 基于当前状态的条件状态变更
///
/// 存储层只有在任务仍处于 `expected` 状态（且指定时 `host` 匹配）时才会应用，
/// 并在同一操作中维护作业计数、主机、时间戳、运行次数和资产计数。
#[derive(Debug, Clone)]
pub struct StateChange {
    pub task_id: Uuid,
    pub expected: TaskState,
    pub new_state: TaskState,
    pub expected_host: Option<String>,
    pub increment_run_count: bool,
    pub exit_status: Option<i32>,
    pub asset_delta: Option<AssetCounts>,
    pub at: DateTime<Utc>,
}

impl StateChange {
    pub fn new(task_id: Uuid, expected: TaskState, new_state: TaskState) -> Self {
        Self {
            task_id,
            expected,
            new_state,
            expected_host: None,
            increment_run_count: false,
            exit_status: None,
            asset_delta: None,
            at: Utc::now(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.expected_host = Some(host.into());
        self
    }

    pub fn with_run_increment(mut self) -> Self {
        self.increment_run_count = true;
        self
    }

    pub fn with_exit_status(mut self, exit_status: i32) -> Self {
        self.exit_status = Some(exit_status);
        self
    }

    pub fn with_asset_delta(mut self, delta: AssetCounts) -> Self {
        if !delta.is_zero() {
            self.asset_delta = Some(delta);
        }
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_prefers_hostname() {
        let ping = AnalystPing::new("10.0.0.5", 5000);
        assert_eq!(ping.endpoint(), "10.0.0.5:5000");

        let ping = ping.with_hostname("analyst-1");
        assert_eq!(ping.endpoint(), "analyst-1:5000");

        let ping = AnalystPing::new("10.0.0.5", 5000).with_hostname("");
        assert_eq!(ping.endpoint(), "10.0.0.5:5000");
    }

    #[test]
    fn test_task_spec_validation_recurses() {
        let spec = TaskSpec::new("parent", serde_json::json!({}))
            .with_child(TaskSpec::new(" ", serde_json::json!({})));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_zero_asset_delta_is_dropped() {
        let change = StateChange::new(Uuid::new_v4(), TaskState::Running, TaskState::Success)
            .with_asset_delta(AssetCounts::default());
        assert!(change.asset_delta.is_none());
    }

    #[test]
    fn test_job_spec_deserialize_defaults() {
        let spec: JobSpec = serde_json::from_value(serde_json::json!({
            "name": "import",
            "project_id": Uuid::new_v4(),
            "tasks": [{"name": "t1", "script": {"generate": []}}]
        }))
        .unwrap();
        assert_eq!(spec.priority, 0);
        assert!(!spec.paused);
        assert_eq!(spec.tasks.len(), 1);
        assert!(spec.tasks[0].children.is_empty());
        assert!(spec.depend_on_job_ids.is_empty());
    }
}
