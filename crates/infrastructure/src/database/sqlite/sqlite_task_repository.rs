use archivist_core::{SchedulerError, SchedulerResult};
use archivist_domain::{
    entities::{AssetCounts, Task, TaskFilter, TaskState},
    repositories::TaskRepository,
    task_dependency_service::TaskDependencyService,
    value_objects::StateChange,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::database::mapping::MappingHelpers;

const TASK_COLUMNS: &str = "id, job_id, project_id, name, script, state, run_count, host, \
    exit_status, depends_on, asset_created, asset_replaced, asset_warning, asset_error, \
    asset_total, time_created, time_started, time_stopped, time_ping, time_modified";

/// 作业仍可分发任务的条件，`tasks.job_id` 需在外层查询中可见
const DISPATCHABLE_JOB: &str = "SELECT j.id FROM jobs j WHERE j.state = 'IN_PROGRESS' \
    AND j.paused = 0 AND j.job_depend_count = 0 \
    AND (j.max_running_tasks IS NULL OR j.task_queued + j.task_running < j.max_running_tasks)";

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> SchedulerResult<Task> {
        let script: String = row.try_get("script")?;
        Ok(Task {
            id: MappingHelpers::get_uuid(row, "id")?,
            job_id: MappingHelpers::get_uuid(row, "job_id")?,
            project_id: MappingHelpers::get_uuid(row, "project_id")?,
            name: row.try_get("name")?,
            script: serde_json::from_str(&script)
                .map_err(|e| SchedulerError::Serialization(format!("解析任务脚本失败: {e}")))?,
            state: row.try_get("state")?,
            run_count: row.try_get("run_count")?,
            host: row.try_get("host")?,
            exit_status: row.try_get("exit_status")?,
            depends_on: MappingHelpers::get_json(row, "depends_on")?,
            asset_counts: MappingHelpers::get_asset_counts(row)?,
            time_created: MappingHelpers::get_time(row, "time_created")?,
            time_started: MappingHelpers::get_opt_time(row, "time_started")?,
            time_stopped: MappingHelpers::get_opt_time(row, "time_stopped")?,
            time_ping: MappingHelpers::get_opt_time(row, "time_ping")?,
            time_modified: MappingHelpers::get_time(row, "time_modified")?,
        })
    }

    async fn fetch_task(conn: &mut SqliteConnection, id: Uuid) -> SchedulerResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn dependency_states(
        conn: &mut SqliteConnection,
        ids: &[Uuid],
    ) -> SchedulerResult<Vec<(Uuid, TaskState)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, state FROM tasks WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id.to_string());
        }
        separated.push_unseparated(")");

        let rows = query.build().fetch_all(&mut *conn).await?;
        rows.iter()
            .map(|row| {
                Ok((
                    MappingHelpers::get_uuid(row, "id")?,
                    row.try_get::<TaskState, _>("state")?,
                ))
            })
            .collect()
    }

    /// 按状态迁移调整作业计数，并累加资产计数
    async fn apply_job_delta(
        conn: &mut SqliteConnection,
        job_id: &str,
        from: Option<TaskState>,
        to: TaskState,
        delta: &AssetCounts,
        at: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let to_col = MappingHelpers::counter_column(to);
        let counter_sql = match from {
            Some(from) => {
                let from_col = MappingHelpers::counter_column(from);
                format!("{from_col} = {from_col} - 1, {to_col} = {to_col} + 1")
            }
            None => format!("{to_col} = {to_col} + 1"),
        };

        sqlx::query(&format!(
            "UPDATE jobs SET {counter_sql}, \
             asset_created = asset_created + ?, asset_replaced = asset_replaced + ?, \
             asset_warning = asset_warning + ?, asset_error = asset_error + ?, \
             asset_total = asset_total + ?, time_updated = ? WHERE id = ?"
        ))
        .bind(delta.created)
        .bind(delta.replaced)
        .bind(delta.warning)
        .bind(delta.error)
        .bind(delta.total)
        .bind(MappingHelpers::millis(at))
        .bind(job_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// 在调用方的事务中写入一批任务
    ///
    /// 初始状态根据依赖任务的当前状态决定，作业计数随之增加。
    pub(crate) async fn insert_tasks(
        conn: &mut SqliteConnection,
        tasks: &[Task],
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Task>> {
        let mut created = Vec::with_capacity(tasks.len());

        for task in tasks {
            // 先写作业行，事务一开始就持有写锁
            let touched = sqlx::query("UPDATE jobs SET time_updated = ? WHERE id = ?")
                .bind(MappingHelpers::millis(now))
                .bind(task.job_id.to_string())
                .execute(&mut *conn)
                .await?;
            if touched.rows_affected() == 0 {
                return Err(SchedulerError::job_not_found(task.job_id));
            }

            TaskDependencyService::validate(task.id, &task.depends_on)
                .map_err(SchedulerError::Validation)?;

            let mut task = task.clone();
            task.state = if task.has_dependencies() {
                let states = Self::dependency_states(&mut *conn, &task.depends_on).await?;
                TaskDependencyService::resolve(&task.depends_on, &states).task_state()
            } else {
                TaskState::Waiting
            };
            if task.state.is_terminal() {
                task.time_stopped = Some(now);
            }

            let script = serde_json::to_string(&task.script)
                .map_err(|e| SchedulerError::Serialization(format!("序列化任务脚本失败: {e}")))?;
            let depends_on = serde_json::to_string(&task.depends_on)
                .map_err(|e| SchedulerError::Serialization(format!("序列化任务依赖失败: {e}")))?;

            sqlx::query(&format!(
                "INSERT INTO tasks ({TASK_COLUMNS}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(task.id.to_string())
            .bind(task.job_id.to_string())
            .bind(task.project_id.to_string())
            .bind(&task.name)
            .bind(script)
            .bind(task.state)
            .bind(task.run_count)
            .bind(&task.host)
            .bind(task.exit_status)
            .bind(depends_on)
            .bind(task.asset_counts.created)
            .bind(task.asset_counts.replaced)
            .bind(task.asset_counts.warning)
            .bind(task.asset_counts.error)
            .bind(task.asset_counts.total)
            .bind(MappingHelpers::millis(task.time_created))
            .bind(MappingHelpers::opt_millis(task.time_started))
            .bind(MappingHelpers::opt_millis(task.time_stopped))
            .bind(MappingHelpers::opt_millis(task.time_ping))
            .bind(MappingHelpers::millis(task.time_modified))
            .execute(&mut *conn)
            .await?;

            for dep in &task.depends_on {
                sqlx::query(
                    "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id) VALUES (?, ?)",
                )
                .bind(task.id.to_string())
                .bind(dep.to_string())
                .execute(&mut *conn)
                .await?;
            }

            let total_only = AssetCounts {
                total: task.asset_counts.total,
                ..Default::default()
            };
            Self::apply_job_delta(
                &mut *conn,
                &task.job_id.to_string(),
                None,
                task.state,
                &total_only,
                now,
            )
            .await?;

            created.push(task);
        }

        Ok(created)
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    async fn create_batch(&self, tasks: &[Task]) -> SchedulerResult<Vec<Task>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let created = Self::insert_tasks(&mut tx, tasks, Utc::now()).await?;
        tx.commit().await?;
        debug!("批量创建 {} 个任务", created.len());
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> SchedulerResult<Option<Task>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_task(&mut conn, id).await
    }

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1"));

        if !filter.ids.is_empty() {
            query.push(" AND id IN (");
            let mut separated = query.separated(", ");
            for id in &filter.ids {
                separated.push_bind(id.to_string());
            }
            separated.push_unseparated(")");
        }
        if let Some(job_id) = filter.job_id {
            query.push(" AND job_id = ").push_bind(job_id.to_string());
        }
        if !filter.states.is_empty() {
            query.push(" AND state IN (");
            let mut separated = query.separated(", ");
            for state in &filter.states {
                separated.push_bind(*state);
            }
            separated.push_unseparated(")");
        }
        if let Some(host) = &filter.host {
            query.push(" AND host = ").push_bind(host.clone());
        }
        query.push(" ORDER BY seq ASC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn dispatch_candidates(&self, limit: usize) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE state = ? AND job_id IN ({DISPATCHABLE_JOB}) \
             ORDER BY (SELECT priority FROM jobs WHERE jobs.id = tasks.job_id) DESC, \
                      time_created ASC, seq ASC \
             LIMIT ?"
        ))
        .bind(TaskState::Waiting)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        task_id: Uuid,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> SchedulerResult<Option<Task>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "UPDATE tasks SET state = ?, host = ?, time_ping = ?, time_modified = ? \
             WHERE id = ? AND state = ? AND job_id IN ({DISPATCHABLE_JOB}) \
             RETURNING job_id"
        ))
        .bind(TaskState::Queued)
        .bind(endpoint)
        .bind(MappingHelpers::millis(at))
        .bind(MappingHelpers::millis(at))
        .bind(task_id.to_string())
        .bind(TaskState::Waiting)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job_id: String = row.try_get("job_id")?;

        Self::apply_job_delta(
            &mut tx,
            &job_id,
            Some(TaskState::Waiting),
            TaskState::Queued,
            &AssetCounts::default(),
            at,
        )
        .await?;

        let task = Self::fetch_task(&mut tx, task_id).await?;
        tx.commit().await?;
        Ok(task)
    }

    #[instrument(skip(self, change), fields(task_id = %change.task_id))]
    async fn apply_state_change(&self, change: &StateChange) -> SchedulerResult<Option<Task>> {
        if !change.expected.can_transition_to(change.new_state) {
            return Err(SchedulerError::InvalidState(format!(
                "不允许的任务状态迁移: {} -> {}",
                change.expected, change.new_state
            )));
        }

        let at = MappingHelpers::millis(change.at);
        let delta = change.asset_delta.unwrap_or_default();
        let mut tx = self.pool.begin().await?;

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE tasks SET state = ");
        query.push_bind(change.new_state);
        query.push(", time_modified = ").push_bind(at);
        if !change.new_state.holds_host() {
            query.push(", host = NULL");
        }
        if change.new_state == TaskState::Running {
            query.push(", time_started = ").push_bind(at);
            query.push(", time_ping = ").push_bind(at);
        }
        if change.new_state.is_terminal()
            || (change.expected.holds_host() && !change.new_state.holds_host())
        {
            query.push(", time_stopped = ").push_bind(at);
        }
        if change.increment_run_count {
            query.push(", run_count = run_count + 1");
        }
        if let Some(exit_status) = change.exit_status {
            query.push(", exit_status = ").push_bind(exit_status);
        }
        if change.asset_delta.is_some() {
            query.push(", asset_created = asset_created + ").push_bind(delta.created);
            query.push(", asset_replaced = asset_replaced + ").push_bind(delta.replaced);
            query.push(", asset_warning = asset_warning + ").push_bind(delta.warning);
            query.push(", asset_error = asset_error + ").push_bind(delta.error);
            query.push(", asset_total = asset_total + ").push_bind(delta.total);
        }
        query.push(" WHERE id = ").push_bind(change.task_id.to_string());
        query.push(" AND state = ").push_bind(change.expected);
        if let Some(host) = &change.expected_host {
            query.push(" AND host = ").push_bind(host.clone());
        }
        query.push(" RETURNING job_id");

        let row = query.build().fetch_optional(&mut *tx).await?;
        let Some(row) = row else {
            debug!(
                "任务 {} 条件更新未生效: 期望状态 {}",
                change.task_id, change.expected
            );
            return Ok(None);
        };
        let job_id: String = row.try_get("job_id")?;

        Self::apply_job_delta(
            &mut tx,
            &job_id,
            Some(change.expected),
            change.new_state,
            &delta,
            change.at,
        )
        .await?;

        let task = Self::fetch_task(&mut tx, change.task_id).await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn update_ping(
        &self,
        task_id: Uuid,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result =
            sqlx::query("UPDATE tasks SET time_ping = ? WHERE id = ? AND host = ? AND state = ?")
                .bind(MappingHelpers::millis(at))
                .bind(task_id.to_string())
                .bind(endpoint)
                .bind(TaskState::Running)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_asset_counts(
        &self,
        task_id: Uuid,
        delta: &AssetCounts,
    ) -> SchedulerResult<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "UPDATE tasks SET asset_created = asset_created + ?, \
             asset_replaced = asset_replaced + ?, asset_warning = asset_warning + ?, \
             asset_error = asset_error + ?, asset_total = asset_total + ?, time_modified = ? \
             WHERE id = ? RETURNING job_id, state",
        )
        .bind(delta.created)
        .bind(delta.replaced)
        .bind(delta.warning)
        .bind(delta.error)
        .bind(delta.total)
        .bind(MappingHelpers::millis(now))
        .bind(task_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };
        let job_id: String = row.try_get("job_id")?;

        sqlx::query(
            "UPDATE jobs SET asset_created = asset_created + ?, \
             asset_replaced = asset_replaced + ?, asset_warning = asset_warning + ?, \
             asset_error = asset_error + ?, asset_total = asset_total + ?, time_updated = ? \
             WHERE id = ?",
        )
        .bind(delta.created)
        .bind(delta.replaced)
        .bind(delta.warning)
        .bind(delta.error)
        .bind(delta.total)
        .bind(MappingHelpers::millis(now))
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn find_orphans(&self, cutoff: DateTime<Utc>) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE state IN (?, ?) AND COALESCE(time_ping, time_modified) < ? \
             ORDER BY seq ASC"
        ))
        .bind(TaskState::Queued)
        .bind(TaskState::Running)
        .bind(MappingHelpers::millis(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn find_dependents(&self, task_id: Uuid) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE state = ? AND id IN \
                (SELECT task_id FROM task_dependencies WHERE depends_on_id = ?) \
             ORDER BY seq ASC"
        ))
        .bind(TaskState::Depend)
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }
}
