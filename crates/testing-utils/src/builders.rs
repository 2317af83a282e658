//! Test data builders for creating test entities
//!
//! 提供带合理默认值的构建器，便于在测试中快速构造作业、任务与Analyst。

use chrono::{DateTime, Utc};
use archivist_domain::entities::{Analyst, AnalystState, Job, LockState, Task};
use archivist_domain::value_objects::{AnalystPing, JobSpec, TaskSpec};
use uuid::Uuid;

/// Builder for creating test JobSpec values
pub struct JobSpecBuilder {
    spec: JobSpec,
}

impl JobSpecBuilder {
    pub fn new() -> Self {
        Self {
            spec: JobSpec::new("test_job", Uuid::new_v4()),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.spec.name = name.to_string();
        self
    }

    pub fn with_project(mut self, project_id: Uuid) -> Self {
        self.spec.project_id = project_id;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.spec.priority = priority;
        self
    }

    pub fn with_max_running_tasks(mut self, max: i64) -> Self {
        self.spec.max_running_tasks = Some(max);
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.spec.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_arg(mut self, key: &str, value: serde_json::Value) -> Self {
        self.spec.args.insert(key.to_string(), value);
        self
    }

    pub fn paused(mut self) -> Self {
        self.spec.paused = true;
        self
    }

    pub fn depends_on_job(mut self, job_id: Uuid) -> Self {
        self.spec.depend_on_job_ids.push(job_id);
        self
    }

    /// 添加一个脚本为 `{"step": name}` 的任务
    pub fn with_task(mut self, name: &str) -> Self {
        self.spec.tasks.push(TaskSpecBuilder::new(name).build());
        self
    }

    pub fn with_task_spec(mut self, task: TaskSpec) -> Self {
        self.spec.tasks.push(task);
        self
    }

    /// 添加 `count` 个独立任务
    pub fn with_tasks(mut self, count: usize) -> Self {
        for i in 0..count {
            self.spec
                .tasks
                .push(TaskSpecBuilder::new(&format!("task_{i}")).build());
        }
        self
    }

    pub fn build(self) -> JobSpec {
        self.spec
    }

    /// 直接构造作业实体，不含任务
    pub fn build_job(self) -> Job {
        Job::new(&self.spec)
    }
}

impl Default for JobSpecBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test TaskSpec values
pub struct TaskSpecBuilder {
    spec: TaskSpec,
}

impl TaskSpecBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            spec: TaskSpec::new(name, serde_json::json!({ "step": name })),
        }
    }

    pub fn with_script(mut self, script: serde_json::Value) -> Self {
        self.spec.script = script;
        self
    }

    pub fn depends_on(mut self, task_id: Uuid) -> Self {
        self.spec.depends_on.push(task_id);
        self
    }

    pub fn with_child(mut self, child: TaskSpec) -> Self {
        self.spec.children.push(child);
        self
    }

    pub fn with_assets(mut self, count: usize) -> Self {
        self.spec
            .asset_ids
            .extend((0..count).map(|i| format!("asset_{i}")));
        self
    }

    pub fn build(self) -> TaskSpec {
        self.spec
    }

    pub fn build_for(self, job: &Job) -> Task {
        Task::new(job, &self.spec)
    }
}

/// Builder for creating test AnalystPing values
pub struct AnalystPingBuilder {
    ping: AnalystPing,
}

impl AnalystPingBuilder {
    pub fn new(hostname: &str) -> Self {
        Self {
            ping: AnalystPing::new("127.0.0.1", 5000).with_hostname(hostname),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.ping.port = port;
        self
    }

    pub fn with_remote_addr(mut self, addr: &str) -> Self {
        self.ping.hostname = None;
        self.ping.remote_addr = addr.to_string();
        self
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.ping.load = load;
        self
    }

    pub fn with_free_ram(mut self, free_ram: i64) -> Self {
        self.ping.free_ram = free_ram;
        self
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.ping.task_id = Some(task_id);
        self
    }

    pub fn build(self) -> AnalystPing {
        self.ping
    }
}

/// Builder for creating test Analyst entities
pub struct AnalystBuilder {
    analyst: Analyst,
}

impl AnalystBuilder {
    pub fn new(hostname: &str) -> Self {
        let ping = AnalystPingBuilder::new(hostname).build();
        Self {
            analyst: Analyst::from_ping(ping.endpoint(), &ping, Utc::now()),
        }
    }

    pub fn with_last_ping(mut self, at: DateTime<Utc>) -> Self {
        self.analyst.time_last_ping = at;
        self
    }

    pub fn locked(mut self) -> Self {
        self.analyst.lock_state = LockState::Locked;
        self
    }

    pub fn down(mut self) -> Self {
        self.analyst.state = AnalystState::Down;
        self
    }

    pub fn build(self) -> Analyst {
        self.analyst
    }
}
