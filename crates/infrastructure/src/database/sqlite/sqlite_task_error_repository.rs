use archivist_core::{SchedulerError, SchedulerResult};
use archivist_domain::{
    entities::{TaskError, TaskErrorFilter},
    repositories::TaskErrorRepository,
};
use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};

use crate::database::mapping::MappingHelpers;

const TASK_ERROR_COLUMNS: &str = "id, task_id, job_id, endpoint, path, message, processor, \
    fatal, phase, stack_trace, time_created";

pub struct SqliteTaskErrorRepository {
    pool: SqlitePool,
}

impl SqliteTaskErrorRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_error(row: &SqliteRow) -> SchedulerResult<TaskError> {
        Ok(TaskError {
            id: MappingHelpers::get_uuid(row, "id")?,
            task_id: MappingHelpers::get_uuid(row, "task_id")?,
            job_id: MappingHelpers::get_uuid(row, "job_id")?,
            endpoint: row.try_get("endpoint")?,
            path: row.try_get("path")?,
            message: row.try_get("message")?,
            processor: row.try_get("processor")?,
            fatal: row.try_get("fatal")?,
            phase: row.try_get("phase")?,
            stack_trace: MappingHelpers::get_json(row, "stack_trace")?,
            time_created: MappingHelpers::get_time(row, "time_created")?,
        })
    }
}

#[async_trait]
impl TaskErrorRepository for SqliteTaskErrorRepository {
    async fn create(&self, error: &TaskError) -> SchedulerResult<TaskError> {
        let stack_trace = serde_json::to_string(&error.stack_trace)
            .map_err(|e| SchedulerError::Serialization(format!("序列化错误堆栈失败: {e}")))?;

        sqlx::query(&format!(
            "INSERT INTO task_errors ({TASK_ERROR_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(error.id.to_string())
        .bind(error.task_id.to_string())
        .bind(error.job_id.to_string())
        .bind(&error.endpoint)
        .bind(&error.path)
        .bind(&error.message)
        .bind(&error.processor)
        .bind(error.fatal)
        .bind(&error.phase)
        .bind(stack_trace)
        .bind(MappingHelpers::millis(error.time_created))
        .execute(&self.pool)
        .await?;

        Ok(error.clone())
    }

    async fn list(&self, filter: &TaskErrorFilter) -> SchedulerResult<Vec<TaskError>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {TASK_ERROR_COLUMNS} FROM task_errors WHERE 1 = 1"
        ));

        if let Some(job_id) = filter.job_id {
            query.push(" AND job_id = ").push_bind(job_id.to_string());
        }
        if let Some(task_id) = filter.task_id {
            query.push(" AND task_id = ").push_bind(task_id.to_string());
        }
        if let Some(fatal) = filter.fatal {
            query.push(" AND fatal = ").push_bind(fatal);
        }
        query.push(" ORDER BY seq ASC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_error).collect()
    }
}
