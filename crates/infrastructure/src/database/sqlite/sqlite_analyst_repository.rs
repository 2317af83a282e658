use archivist_core::{SchedulerError, SchedulerResult};
use archivist_domain::{
    entities::{Analyst, AnalystFilter, AnalystState, LockState},
    repositories::AnalystRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::database::mapping::MappingHelpers;

const ANALYST_COLUMNS: &str = "endpoint, total_ram, free_ram, free_disk, load, version, state, \
    lock_state, current_task_id, time_created, time_last_ping";

pub struct SqliteAnalystRepository {
    pool: SqlitePool,
}

impl SqliteAnalystRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_analyst(row: &SqliteRow) -> SchedulerResult<Analyst> {
        Ok(Analyst {
            endpoint: row.try_get("endpoint")?,
            total_ram: row.try_get("total_ram")?,
            free_ram: row.try_get("free_ram")?,
            free_disk: row.try_get("free_disk")?,
            load: row.try_get("load")?,
            version: row.try_get("version")?,
            state: row.try_get("state")?,
            lock_state: row.try_get("lock_state")?,
            current_task_id: MappingHelpers::get_opt_uuid(row, "current_task_id")?,
            time_created: MappingHelpers::get_time(row, "time_created")?,
            time_last_ping: MappingHelpers::get_time(row, "time_last_ping")?,
        })
    }
}

#[async_trait]
impl AnalystRepository for SqliteAnalystRepository {
    async fn upsert(&self, analyst: &Analyst) -> SchedulerResult<Analyst> {
        sqlx::query(&format!(
            r#"
            INSERT INTO analysts ({ANALYST_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (endpoint) DO UPDATE SET
                total_ram = excluded.total_ram,
                free_ram = excluded.free_ram,
                free_disk = excluded.free_disk,
                load = excluded.load,
                version = excluded.version,
                state = excluded.state,
                current_task_id = excluded.current_task_id,
                time_last_ping = excluded.time_last_ping
            "#
        ))
        .bind(&analyst.endpoint)
        .bind(analyst.total_ram)
        .bind(analyst.free_ram)
        .bind(analyst.free_disk)
        .bind(analyst.load)
        .bind(&analyst.version)
        .bind(AnalystState::Up)
        .bind(analyst.lock_state)
        .bind(analyst.current_task_id.map(|id| id.to_string()))
        .bind(MappingHelpers::millis(analyst.time_created))
        .bind(MappingHelpers::millis(analyst.time_last_ping))
        .execute(&self.pool)
        .await?;

        self.get(&analyst.endpoint)
            .await?
            .ok_or_else(|| SchedulerError::analyst_not_found(&analyst.endpoint))
    }

    async fn get(&self, endpoint: &str) -> SchedulerResult<Option<Analyst>> {
        let row = sqlx::query(&format!(
            "SELECT {ANALYST_COLUMNS} FROM analysts WHERE endpoint = ?"
        ))
        .bind(endpoint)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_analyst).transpose()
    }

    async fn list(&self, filter: &AnalystFilter) -> SchedulerResult<Vec<Analyst>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {ANALYST_COLUMNS} FROM analysts WHERE 1 = 1"));

        if let Some(state) = filter.state {
            query.push(" AND state = ").push_bind(state);
        }
        if let Some(lock_state) = filter.lock_state {
            query.push(" AND lock_state = ").push_bind(lock_state);
        }
        if !filter.endpoints.is_empty() {
            query.push(" AND endpoint IN (");
            let mut separated = query.separated(", ");
            for endpoint in &filter.endpoints {
                separated.push_bind(endpoint.clone());
            }
            separated.push_unseparated(")");
        }
        query.push(" ORDER BY endpoint ASC");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_analyst).collect()
    }

    async fn mark_down_if_silent(
        &self,
        endpoint: &str,
        cutoff: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE analysts SET state = ? \
             WHERE endpoint = ? AND state = ? AND time_last_ping < ?",
        )
        .bind(AnalystState::Down)
        .bind(endpoint)
        .bind(AnalystState::Up)
        .bind(MappingHelpers::millis(cutoff))
        .execute(&self.pool)
        .await?;

        let updated = result.rows_affected() > 0;
        if updated {
            debug!("Analyst {} 状态更新为 DOWN", endpoint);
        }
        Ok(updated)
    }

    async fn set_lock_state(
        &self,
        endpoint: &str,
        lock_state: LockState,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query("UPDATE analysts SET lock_state = ? WHERE endpoint = ?")
            .bind(lock_state)
            .bind(endpoint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_task_id(&self, endpoint: &str, task_id: Option<Uuid>) -> SchedulerResult<bool> {
        let result = sqlx::query("UPDATE analysts SET current_task_id = ? WHERE endpoint = ?")
            .bind(task_id.map(|id| id.to_string()))
            .bind(endpoint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_if_silent(
        &self,
        endpoint: &str,
        cutoff: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "DELETE FROM analysts WHERE endpoint = ? AND state = ? AND time_last_ping < ?",
        )
        .bind(endpoint)
        .bind(AnalystState::Down)
        .bind(MappingHelpers::millis(cutoff))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!("删除Analyst记录: {} ({})", endpoint, Utc::now());
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::sqlite::test_support::setup_test_db;
    use archivist_domain::value_objects::AnalystPing;

    fn later() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(60)
    }

    fn analyst(host: &str) -> Analyst {
        let ping = AnalystPing::new("10.0.0.1", 5000).with_hostname(host);
        Analyst::from_ping(ping.endpoint(), &ping, Utc::now())
    }

    #[tokio::test]
    async fn test_upsert_preserves_lock_and_creation() {
        let db = setup_test_db().await;
        let repo = db.analyst_repository();

        let first = repo.upsert(&analyst("render-1")).await.unwrap();
        assert_eq!(first.endpoint, "render-1:5000");
        assert!(first.is_up());

        assert!(repo
            .set_lock_state(&first.endpoint, LockState::Locked)
            .await
            .unwrap());
        repo.mark_down_if_silent(&first.endpoint, later())
            .await
            .unwrap();

        let mut again = analyst("render-1");
        again.free_ram = 1024;
        again.time_created = Utc::now() + chrono::Duration::hours(1);
        let second = repo.upsert(&again).await.unwrap();

        assert!(second.is_up());
        assert!(second.is_locked());
        assert_eq!(second.free_ram, 1024);
        assert_eq!(
            second.time_created.timestamp_millis(),
            first.time_created.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_mark_down_requires_stale_ping() {
        let db = setup_test_db().await;
        let repo = db.analyst_repository();
        let a = repo.upsert(&analyst("render-2")).await.unwrap();

        let earlier = Utc::now() - chrono::Duration::seconds(60);
        assert!(!repo.mark_down_if_silent(&a.endpoint, earlier).await.unwrap());
        assert!(repo.mark_down_if_silent(&a.endpoint, later()).await.unwrap());
        assert!(!repo.mark_down_if_silent(&a.endpoint, later()).await.unwrap());
        assert!(!repo.mark_down_if_silent("missing:1", later()).await.unwrap());

        // 心跳恢复为Up后不会被清理
        repo.upsert(&analyst("render-2")).await.unwrap();
        assert!(!repo.delete_if_silent(&a.endpoint, later()).await.unwrap());
        assert!(repo.get(&a.endpoint).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_filter_task_id_and_delete() {
        let db = setup_test_db().await;
        let repo = db.analyst_repository();
        let a = repo.upsert(&analyst("render-a")).await.unwrap();
        let b = repo.upsert(&analyst("render-b")).await.unwrap();
        repo.mark_down_if_silent(&b.endpoint, later()).await.unwrap();

        let up = repo
            .list(&AnalystFilter {
                state: Some(AnalystState::Up),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].endpoint, a.endpoint);

        let task_id = Uuid::new_v4();
        assert!(repo.set_task_id(&a.endpoint, Some(task_id)).await.unwrap());
        let fetched = repo.get(&a.endpoint).await.unwrap().unwrap();
        assert_eq!(fetched.current_task_id, Some(task_id));

        let earlier = Utc::now() - chrono::Duration::seconds(60);
        assert!(!repo.delete_if_silent(&b.endpoint, earlier).await.unwrap());
        assert!(repo.delete_if_silent(&b.endpoint, later()).await.unwrap());
        assert!(repo.get(&b.endpoint).await.unwrap().is_none());
        assert!(!repo.delete_if_silent(&b.endpoint, later()).await.unwrap());
    }
}
