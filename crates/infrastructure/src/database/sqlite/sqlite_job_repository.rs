use archivist_core::{SchedulerError, SchedulerResult};
use archivist_domain::{
    entities::{Job, JobFilter, JobState, Task, TaskStateCounts},
    repositories::JobRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::database::mapping::MappingHelpers;
use crate::database::sqlite::SqliteTaskRepository;

pub(crate) const JOB_COLUMNS: &str = "id, project_id, name, priority, paused, state, \
    task_waiting, task_depend, task_queued, task_running, task_success, task_failure, task_skipped, \
    asset_created, asset_replaced, asset_warning, asset_error, asset_total, \
    args, env, max_running_tasks, depend_on_job_ids, job_depend_count, \
    time_created, time_started, time_updated";

pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) fn row_to_job(row: &SqliteRow) -> SchedulerResult<Job> {
        Ok(Job {
            id: MappingHelpers::get_uuid(row, "id")?,
            project_id: MappingHelpers::get_uuid(row, "project_id")?,
            name: row.try_get("name")?,
            priority: row.try_get("priority")?,
            paused: row.try_get("paused")?,
            state: row.try_get("state")?,
            task_counts: TaskStateCounts {
                waiting: row.try_get("task_waiting")?,
                depend: row.try_get("task_depend")?,
                queued: row.try_get("task_queued")?,
                running: row.try_get("task_running")?,
                success: row.try_get("task_success")?,
                failure: row.try_get("task_failure")?,
                skipped: row.try_get("task_skipped")?,
            },
            asset_counts: MappingHelpers::get_asset_counts(row)?,
            args: MappingHelpers::get_json(row, "args")?,
            env: MappingHelpers::get_json(row, "env")?,
            max_running_tasks: row.try_get("max_running_tasks")?,
            depend_on_job_ids: MappingHelpers::get_json(row, "depend_on_job_ids")?,
            job_depend_count: row.try_get("job_depend_count")?,
            time_created: MappingHelpers::get_time(row, "time_created")?,
            time_started: MappingHelpers::get_opt_time(row, "time_started")?,
            time_updated: MappingHelpers::get_time(row, "time_updated")?,
        })
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    #[instrument(skip(self, job, tasks), fields(job_id = %job.id, tasks = tasks.len()))]
    async fn create(&self, job: &Job, tasks: &[Task]) -> SchedulerResult<Job> {
        let args = serde_json::to_string(&job.args)
            .map_err(|e| SchedulerError::Serialization(format!("序列化作业参数失败: {e}")))?;
        let env = serde_json::to_string(&job.env)
            .map_err(|e| SchedulerError::Serialization(format!("序列化作业环境变量失败: {e}")))?;
        let depend_on_job_ids = serde_json::to_string(&job.depend_on_job_ids)
            .map_err(|e| SchedulerError::Serialization(format!("序列化依赖作业失败: {e}")))?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // 先写作业行，事务一开始就持有写锁，依赖作业的状态在提交前不会变化
        sqlx::query(
            r#"
            INSERT INTO jobs (id, project_id, name, priority, paused, state,
                args, env, max_running_tasks, depend_on_job_ids,
                time_created, time_started, time_updated)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.project_id.to_string())
        .bind(&job.name)
        .bind(job.priority)
        .bind(job.paused)
        .bind(job.state)
        .bind(args)
        .bind(env)
        .bind(job.max_running_tasks)
        .bind(depend_on_job_ids)
        .bind(MappingHelpers::millis(job.time_created))
        .bind(MappingHelpers::opt_millis(job.time_started))
        .bind(MappingHelpers::millis(job.time_updated))
        .execute(&mut *tx)
        .await?;

        let mut unresolved: i64 = 0;
        for dep in &job.depend_on_job_ids {
            let dep_state: Option<JobState> =
                sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?")
                    .bind(dep.to_string())
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some(dep_state) = dep_state else {
                return Err(SchedulerError::job_not_found(*dep));
            };

            let resolved = dep_state.is_finished();
            if !resolved {
                unresolved += 1;
            }
            sqlx::query(
                "INSERT INTO job_dependencies (job_id, depends_on_job_id, resolved) VALUES (?, ?, ?)",
            )
            .bind(job.id.to_string())
            .bind(dep.to_string())
            .bind(resolved)
            .execute(&mut *tx)
            .await?;
        }
        if unresolved > 0 {
            sqlx::query("UPDATE jobs SET job_depend_count = ? WHERE id = ?")
                .bind(unresolved)
                .bind(job.id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        SqliteTaskRepository::insert_tasks(&mut tx, tasks, now).await?;
        tx.commit().await?;

        debug!("创建作业成功: {}", job.entity_description());
        self.get(job.id)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(job.id))
    }

    async fn get(&self, id: Uuid) -> SchedulerResult<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list(&self, filter: &JobFilter) -> SchedulerResult<Vec<Job>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1 = 1"));

        if let Some(state) = filter.state {
            query.push(" AND state = ").push_bind(state);
        }
        if let Some(project_id) = filter.project_id {
            query.push(" AND project_id = ").push_bind(project_id.to_string());
        }
        if let Some(paused) = filter.paused {
            query.push(" AND paused = ").push_bind(paused);
        }
        query.push(" ORDER BY time_created ASC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn set_state(
        &self,
        id: Uuid,
        new_state: JobState,
        expected: Option<JobState>,
    ) -> SchedulerResult<bool> {
        let now = MappingHelpers::millis(Utc::now());
        let result = match expected {
            Some(expected) => {
                sqlx::query(
                    "UPDATE jobs SET state = ?, time_updated = ? WHERE id = ? AND state = ?",
                )
                .bind(new_state)
                .bind(now)
                .bind(id.to_string())
                .bind(expected)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("UPDATE jobs SET state = ?, time_updated = ? WHERE id = ?")
                    .bind(new_state)
                    .bind(now)
                    .bind(id.to_string())
                    .execute(&self.pool)
                    .await?
            }
        };

        let updated = result.rows_affected() > 0;
        if updated {
            debug!("作业 {} 状态更新为 {}", id, new_state);
        }
        Ok(updated)
    }

    async fn set_paused(&self, id: Uuid, paused: bool) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET paused = ?, time_updated = ? WHERE id = ? AND paused != ?",
        )
        .bind(paused)
        .bind(MappingHelpers::millis(Utc::now()))
        .bind(id.to_string())
        .bind(paused)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch_started(&self, id: Uuid, at: DateTime<Utc>) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET time_started = ? WHERE id = ? AND time_started IS NULL",
        )
        .bind(MappingHelpers::millis(at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn resolve_job_dependents(&self, job_id: Uuid) -> SchedulerResult<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;
        let waiting: Vec<String> = sqlx::query_scalar(
            "UPDATE job_dependencies SET resolved = 1 \
             WHERE depends_on_job_id = ? AND resolved = 0 RETURNING job_id",
        )
        .bind(job_id.to_string())
        .fetch_all(&mut *tx)
        .await?;

        let now = MappingHelpers::millis(Utc::now());
        let mut released = Vec::new();
        for id in waiting {
            let remaining: Option<i64> = sqlx::query_scalar(
                "UPDATE jobs SET job_depend_count = job_depend_count - 1, time_updated = ? \
                 WHERE id = ? RETURNING job_depend_count",
            )
            .bind(now)
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?;
            if remaining == Some(0) {
                released.push(MappingHelpers::parse_uuid(&id)?);
            }
        }

        tx.commit().await?;
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::sqlite::test_support::setup_test_db;
    use archivist_domain::value_objects::JobSpec;

    fn create_test_job(priority: i32) -> Job {
        let mut spec = JobSpec::new("import", Uuid::new_v4()).with_priority(priority);
        spec.env.insert("LANG".to_string(), "C".to_string());
        spec.args
            .insert("batch".to_string(), serde_json::json!({"size": 10}));
        Job::new(&spec)
    }

    #[tokio::test]
    async fn test_create_and_get_job() {
        let db = setup_test_db().await;
        let repo = db.job_repository();
        let job = create_test_job(5);

        let created = repo.create(&job, &[]).await.unwrap();
        assert_eq!(created.id, job.id);
        assert_eq!(created.priority, 5);
        assert_eq!(created.state, JobState::InProgress);
        assert_eq!(created.env.get("LANG").map(String::as_str), Some("C"));
        assert_eq!(created.args["batch"]["size"], 10);
        assert_eq!(created.task_counts.total(), 0);
    }

    #[tokio::test]
    async fn test_conditional_state_change() {
        let db = setup_test_db().await;
        let repo = db.job_repository();
        let job = repo.create(&create_test_job(0), &[]).await.unwrap();

        assert!(repo
            .set_state(job.id, JobState::Cancelled, Some(JobState::InProgress))
            .await
            .unwrap());
        assert!(!repo
            .set_state(job.id, JobState::Success, Some(JobState::InProgress))
            .await
            .unwrap());
        let job = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_pause_and_touch_started() {
        let db = setup_test_db().await;
        let repo = db.job_repository();
        let job = repo.create(&create_test_job(0), &[]).await.unwrap();

        assert!(repo.set_paused(job.id, true).await.unwrap());
        assert!(!repo.set_paused(job.id, true).await.unwrap());

        let first = Utc::now();
        assert!(repo.touch_started(job.id, first).await.unwrap());
        assert!(!repo.touch_started(job.id, Utc::now()).await.unwrap());

        let job = repo.get(job.id).await.unwrap().unwrap();
        assert!(job.paused);
        assert_eq!(
            job.time_started.map(|t| t.timestamp_millis()),
            Some(first.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn test_list_with_filter() {
        let db = setup_test_db().await;
        let repo = db.job_repository();
        let a = repo.create(&create_test_job(0), &[]).await.unwrap();
        repo.create(&create_test_job(1), &[]).await.unwrap();
        repo.set_paused(a.id, true).await.unwrap();

        let paused = repo
            .list(&JobFilter {
                paused: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(paused.len(), 1);
        assert_eq!(paused[0].id, a.id);

        let all = repo.list(&JobFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
