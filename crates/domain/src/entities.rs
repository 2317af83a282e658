use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_objects::{AnalystPing, JobSpec, TaskSpec};

/// 作业状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::InProgress => "IN_PROGRESS",
            JobState::Success => "SUCCESS",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IN_PROGRESS" => Some(JobState::InProgress),
            "SUCCESS" => Some(JobState::Success),
            "FAILED" => Some(JobState::Failed),
            "CANCELLED" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务状态
///
/// 状态迁移只能沿着 [`TaskState::can_transition_to`] 给出的边进行，
/// 存储层把每次迁移实现为基于当前状态的条件更新。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    #[serde(rename = "WAITING")]
    Waiting,
    #[serde(rename = "DEPEND")]
    Depend,
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
    #[serde(rename = "SKIPPED")]
    Skipped,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        TaskState::Waiting,
        TaskState::Depend,
        TaskState::Queued,
        TaskState::Running,
        TaskState::Success,
        TaskState::Failure,
        TaskState::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Waiting => "WAITING",
            TaskState::Depend => "DEPEND",
            TaskState::Queued => "QUEUED",
            TaskState::Running => "RUNNING",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
            TaskState::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|state| state.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Skipped
        )
    }

    /// 该状态下任务由某个Analyst持有
    pub fn holds_host(&self) -> bool {
        matches!(self, TaskState::Queued | TaskState::Running)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Waiting, Queued)
                | (Waiting, Skipped)
                | (Depend, Waiting)
                | (Depend, Skipped)
                | (Queued, Running)
                | (Queued, Waiting)
                | (Queued, Failure)
                | (Queued, Skipped)
                | (Running, Success)
                | (Running, Waiting)
                | (Running, Failure)
                | (Running, Skipped)
                | (Failure, Waiting)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 作业下各状态任务数
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskStateCounts {
    pub waiting: i64,
    pub depend: i64,
    pub queued: i64,
    pub running: i64,
    pub success: i64,
    pub failure: i64,
    pub skipped: i64,
}

impl TaskStateCounts {
    pub fn get(&self, state: TaskState) -> i64 {
        match state {
            TaskState::Waiting => self.waiting,
            TaskState::Depend => self.depend,
            TaskState::Queued => self.queued,
            TaskState::Running => self.running,
            TaskState::Success => self.success,
            TaskState::Failure => self.failure,
            TaskState::Skipped => self.skipped,
        }
    }

    pub fn adjust(&mut self, state: TaskState, delta: i64) {
        let slot = match state {
            TaskState::Waiting => &mut self.waiting,
            TaskState::Depend => &mut self.depend,
            TaskState::Queued => &mut self.queued,
            TaskState::Running => &mut self.running,
            TaskState::Success => &mut self.success,
            TaskState::Failure => &mut self.failure,
            TaskState::Skipped => &mut self.skipped,
        };
        *slot += delta;
    }

    /// 一次状态迁移对计数的影响
    pub fn transition(&mut self, from: TaskState, to: TaskState) {
        self.adjust(from, -1);
        self.adjust(to, 1);
    }

    pub fn total(&self) -> i64 {
        TaskState::ALL.iter().map(|s| self.get(*s)).sum()
    }

    pub fn pending(&self) -> i64 {
        self.waiting + self.depend + self.queued + self.running
    }

    pub fn active(&self) -> i64 {
        self.queued + self.running
    }
}

/// 资产处理结果计数
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetCounts {
    pub created: i64,
    pub replaced: i64,
    pub warning: i64,
    pub error: i64,
    pub total: i64,
}

impl AssetCounts {
    pub fn warnings(count: i64) -> Self {
        Self {
            warning: count,
            ..Default::default()
        }
    }

    pub fn errors(count: i64) -> Self {
        Self {
            error: count,
            ..Default::default()
        }
    }

    pub fn add(&mut self, other: &AssetCounts) {
        self.created += other.created;
        self.replaced += other.replaced;
        self.warning += other.warning;
        self.error += other.error;
        self.total += other.total;
    }

    pub fn is_zero(&self) -> bool {
        *self == AssetCounts::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    /// 数值越大越先分发
    pub priority: i32,
    pub paused: bool,
    pub state: JobState,
    pub task_counts: TaskStateCounts,
    pub asset_counts: AssetCounts,
    pub args: HashMap<String, serde_json::Value>,
    pub env: HashMap<String, String>,
    /// 同时处于 Queued/Running 的任务上限
    pub max_running_tasks: Option<i64>,
    pub depend_on_job_ids: Vec<Uuid>,
    /// 尚未结束的依赖作业数，由存储层维护，大于0时不分发任务
    pub job_depend_count: i64,
    pub time_created: DateTime<Utc>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_updated: DateTime<Utc>,
}

impl Job {
    pub fn new(spec: &JobSpec) -> Self {
        let now = Utc::now();
        let mut depend_on_job_ids: Vec<Uuid> = Vec::with_capacity(spec.depend_on_job_ids.len());
        for id in &spec.depend_on_job_ids {
            if !depend_on_job_ids.contains(id) {
                depend_on_job_ids.push(*id);
            }
        }
        Self {
            id: Uuid::new_v4(),
            project_id: spec.project_id,
            name: spec.name.clone(),
            priority: spec.priority,
            paused: spec.paused,
            state: JobState::InProgress,
            task_counts: TaskStateCounts::default(),
            asset_counts: AssetCounts::default(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            max_running_tasks: spec.max_running_tasks,
            depend_on_job_ids,
            job_depend_count: 0,
            time_created: now,
            time_started: None,
            time_updated: now,
        }
    }

    /// 是否可以继续分发任务
    pub fn is_dispatchable(&self) -> bool {
        self.state == JobState::InProgress
            && !self.paused
            && self.job_depend_count == 0
            && self
                .max_running_tasks
                .map(|max| self.task_counts.active() < max)
                .unwrap_or(true)
    }

    pub fn entity_description(&self) -> String {
        format!("作业 '{}' (ID: {})", self.name, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    /// 处理脚本，调度核心不解析其内容
    pub script: serde_json::Value,
    pub state: TaskState,
    pub run_count: i32,
    pub host: Option<String>,
    pub exit_status: Option<i32>,
    pub depends_on: Vec<Uuid>,
    pub asset_counts: AssetCounts,
    pub time_created: DateTime<Utc>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_stopped: Option<DateTime<Utc>>,
    pub time_ping: Option<DateTime<Utc>>,
    pub time_modified: DateTime<Utc>,
}

impl Task {
    /// 根据任务描述创建任务，初始状态由存储层在创建时根据依赖决定
    pub fn new(job: &Job, spec: &TaskSpec) -> Self {
        let now = Utc::now();
        let state = if spec.depends_on.is_empty() {
            TaskState::Waiting
        } else {
            TaskState::Depend
        };
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            project_id: job.project_id,
            name: spec.name.clone(),
            script: spec.script.clone(),
            state,
            run_count: 0,
            host: None,
            exit_status: None,
            depends_on: spec.depends_on.clone(),
            asset_counts: AssetCounts {
                total: spec.asset_ids.len() as i64,
                ..Default::default()
            },
            time_created: now,
            time_started: None,
            time_stopped: None,
            time_ping: None,
            time_modified: now,
        }
    }

    pub fn has_dependencies(&self) -> bool {
        !self.depends_on.is_empty()
    }

    pub fn is_held_by(&self, endpoint: &str) -> bool {
        self.host.as_deref() == Some(endpoint)
    }

    pub fn entity_description(&self) -> String {
        match &self.host {
            Some(host) => format!("任务 '{}' (ID: {}, Analyst: {})", self.name, self.id, host),
            None => format!("任务 '{}' (ID: {})", self.name, self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AnalystState {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
}

impl AnalystState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalystState::Up => "UP",
            AnalystState::Down => "DOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UP" => Some(AnalystState::Up),
            "DOWN" => Some(AnalystState::Down),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LockState {
    #[serde(rename = "UNLOCKED")]
    Unlocked,
    #[serde(rename = "LOCKED")]
    Locked,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Unlocked => "UNLOCKED",
            LockState::Locked => "LOCKED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNLOCKED" => Some(LockState::Unlocked),
            "LOCKED" => Some(LockState::Locked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analyst {
    /// host:port，Analyst的唯一标识
    pub endpoint: String,
    pub total_ram: i64,
    pub free_ram: i64,
    pub free_disk: i64,
    pub load: f64,
    pub version: String,
    pub state: AnalystState,
    pub lock_state: LockState,
    pub current_task_id: Option<Uuid>,
    pub time_created: DateTime<Utc>,
    pub time_last_ping: DateTime<Utc>,
}

impl Analyst {
    pub fn from_ping(endpoint: String, ping: &AnalystPing, now: DateTime<Utc>) -> Self {
        Self {
            endpoint,
            total_ram: ping.total_ram,
            free_ram: ping.free_ram,
            free_disk: ping.free_disk,
            load: ping.load,
            version: ping.version.clone(),
            state: AnalystState::Up,
            lock_state: LockState::Unlocked,
            current_task_id: ping.task_id,
            time_created: now,
            time_last_ping: now,
        }
    }

    pub fn is_up(&self) -> bool {
        self.state == AnalystState::Up
    }

    pub fn is_locked(&self) -> bool {
        self.lock_state == LockState::Locked
    }

    /// 能否接收新任务
    pub fn can_accept_task(&self) -> bool {
        self.is_up() && !self.is_locked()
    }

    pub fn is_heartbeat_expired(&self, now: DateTime<Utc>, timeout_seconds: i64) -> bool {
        (now - self.time_last_ping).num_seconds() > timeout_seconds
    }
}

/// Analyst上报的处理错误记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub id: Uuid,
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub endpoint: String,
    pub path: Option<String>,
    pub message: String,
    pub processor: Option<String>,
    pub fatal: bool,
    pub phase: String,
    pub stack_trace: Vec<String>,
    pub time_created: DateTime<Utc>,
}

/// 交给Analyst执行的任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchTask {
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub script: serde_json::Value,
    pub run_count: i32,
    pub args: HashMap<String, serde_json::Value>,
    pub env: HashMap<String, String>,
}

impl DispatchTask {
    pub const ENV_TASK_ID: &'static str = "ARCHIVIST_TASK_ID";
    pub const ENV_JOB_ID: &'static str = "ARCHIVIST_JOB_ID";
    pub const ENV_PROJECT_ID: &'static str = "ARCHIVIST_PROJECT_ID";

    pub fn new(task: &Task, job: &Job) -> Self {
        let mut env = job.env.clone();
        env.insert(Self::ENV_TASK_ID.to_string(), task.id.to_string());
        env.insert(Self::ENV_JOB_ID.to_string(), job.id.to_string());
        env.insert(Self::ENV_PROJECT_ID.to_string(), job.project_id.to_string());

        Self {
            task_id: task.id,
            job_id: task.job_id,
            project_id: task.project_id,
            name: task.name.clone(),
            script: task.script.clone(),
            run_count: task.run_count,
            args: job.args.clone(),
            env,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub project_id: Option<Uuid>,
    pub paused: Option<bool>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub ids: Vec<Uuid>,
    pub job_id: Option<Uuid>,
    pub states: Vec<TaskState>,
    pub host: Option<String>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn for_job(job_id: Uuid) -> Self {
        Self {
            job_id: Some(job_id),
            ..Default::default()
        }
    }

    pub fn with_states(mut self, states: &[TaskState]) -> Self {
        self.states = states.to_vec();
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        (self.ids.is_empty() || self.ids.contains(&task.id))
            && self.job_id.map(|id| id == task.job_id).unwrap_or(true)
            && (self.states.is_empty() || self.states.contains(&task.state))
            && self
                .host
                .as_deref()
                .map(|h| task.host.as_deref() == Some(h))
                .unwrap_or(true)
    }
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.state.map(|s| s == job.state).unwrap_or(true)
            && self.project_id.map(|p| p == job.project_id).unwrap_or(true)
            && self.paused.map(|p| p == job.paused).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalystFilter {
    pub state: Option<AnalystState>,
    pub lock_state: Option<LockState>,
    pub endpoints: Vec<String>,
}

impl AnalystFilter {
    pub fn matches(&self, analyst: &Analyst) -> bool {
        self.state.map(|s| s == analyst.state).unwrap_or(true)
            && self.lock_state.map(|l| l == analyst.lock_state).unwrap_or(true)
            && (self.endpoints.is_empty() || self.endpoints.contains(&analyst.endpoint))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskErrorFilter {
    pub job_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub fatal: Option<bool>,
    pub limit: Option<usize>,
}

impl TaskErrorFilter {
    pub fn matches(&self, error: &TaskError) -> bool {
        self.job_id.map(|id| id == error.job_id).unwrap_or(true)
            && self.task_id.map(|id| id == error.task_id).unwrap_or(true)
            && self.fatal.map(|f| f == error.fatal).unwrap_or(true)
    }
}
