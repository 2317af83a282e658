pub mod sqlite_analyst_repository;
pub mod sqlite_job_repository;
pub mod sqlite_task_error_repository;
pub mod sqlite_task_repository;

pub use sqlite_analyst_repository::SqliteAnalystRepository;
pub use sqlite_job_repository::SqliteJobRepository;
pub use sqlite_task_error_repository::SqliteTaskErrorRepository;
pub use sqlite_task_repository::SqliteTaskRepository;

use std::str::FromStr;
use std::time::Duration;

use archivist_core::{DatabaseConfig, SchedulerResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        name TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        paused INTEGER NOT NULL DEFAULT 0,
        state TEXT NOT NULL,
        task_waiting INTEGER NOT NULL DEFAULT 0,
        task_depend INTEGER NOT NULL DEFAULT 0,
        task_queued INTEGER NOT NULL DEFAULT 0,
        task_running INTEGER NOT NULL DEFAULT 0,
        task_success INTEGER NOT NULL DEFAULT 0,
        task_failure INTEGER NOT NULL DEFAULT 0,
        task_skipped INTEGER NOT NULL DEFAULT 0,
        asset_created INTEGER NOT NULL DEFAULT 0,
        asset_replaced INTEGER NOT NULL DEFAULT 0,
        asset_warning INTEGER NOT NULL DEFAULT 0,
        asset_error INTEGER NOT NULL DEFAULT 0,
        asset_total INTEGER NOT NULL DEFAULT 0,
        args TEXT NOT NULL DEFAULT '{}',
        env TEXT NOT NULL DEFAULT '{}',
        max_running_tasks INTEGER,
        depend_on_job_ids TEXT NOT NULL DEFAULT '[]',
        job_depend_count INTEGER NOT NULL DEFAULT 0,
        time_created INTEGER NOT NULL,
        time_started INTEGER,
        time_updated INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state, paused, priority)",
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        job_id TEXT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
        project_id TEXT NOT NULL,
        name TEXT NOT NULL,
        script TEXT NOT NULL,
        state TEXT NOT NULL,
        run_count INTEGER NOT NULL DEFAULT 0,
        host TEXT,
        exit_status INTEGER,
        depends_on TEXT NOT NULL DEFAULT '[]',
        asset_created INTEGER NOT NULL DEFAULT 0,
        asset_replaced INTEGER NOT NULL DEFAULT 0,
        asset_warning INTEGER NOT NULL DEFAULT 0,
        asset_error INTEGER NOT NULL DEFAULT 0,
        asset_total INTEGER NOT NULL DEFAULT 0,
        time_created INTEGER NOT NULL,
        time_started INTEGER,
        time_stopped INTEGER,
        time_ping INTEGER,
        time_modified INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_job_state ON tasks (job_id, state)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_state_ping ON tasks (state, time_ping)",
    r#"
    CREATE TABLE IF NOT EXISTS task_dependencies (
        task_id TEXT NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
        depends_on_id TEXT NOT NULL,
        PRIMARY KEY (task_id, depends_on_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_dependencies_target ON task_dependencies (depends_on_id)",
    r#"
    CREATE TABLE IF NOT EXISTS job_dependencies (
        job_id TEXT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
        depends_on_job_id TEXT NOT NULL,
        resolved INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (job_id, depends_on_job_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_job_dependencies_target ON job_dependencies (depends_on_job_id, resolved)",
    r#"
    CREATE TABLE IF NOT EXISTS analysts (
        endpoint TEXT PRIMARY KEY,
        total_ram INTEGER NOT NULL DEFAULT 0,
        free_ram INTEGER NOT NULL DEFAULT 0,
        free_disk INTEGER NOT NULL DEFAULT 0,
        load REAL NOT NULL DEFAULT 0,
        version TEXT NOT NULL DEFAULT '',
        state TEXT NOT NULL,
        lock_state TEXT NOT NULL DEFAULT 'UNLOCKED',
        current_task_id TEXT,
        time_created INTEGER NOT NULL,
        time_last_ping INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_errors (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        task_id TEXT NOT NULL,
        job_id TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        path TEXT,
        message TEXT NOT NULL,
        processor TEXT,
        fatal INTEGER NOT NULL DEFAULT 0,
        phase TEXT NOT NULL DEFAULT '',
        stack_trace TEXT NOT NULL DEFAULT '[]',
        time_created INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_errors_job ON task_errors (job_id, task_id)",
];

/// SQLite 连接池与表结构管理
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    pub async fn connect(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let connect_options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

        let pool_options = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds));

        // 内存数据库每个连接都是独立的库，只能使用一个永不回收的连接
        let pool_options = if config.url.contains(":memory:") {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
        };

        let pool = pool_options.connect_with(connect_options).await?;

        info!("已连接SQLite数据库: {}", config.url);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> SchedulerResult<()> {
        debug!("Running SQLite database migrations");
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn job_repository(&self) -> SqliteJobRepository {
        SqliteJobRepository::new(self.pool.clone())
    }

    pub fn task_repository(&self) -> SqliteTaskRepository {
        SqliteTaskRepository::new(self.pool.clone())
    }

    pub fn analyst_repository(&self) -> SqliteAnalystRepository {
        SqliteAnalystRepository::new(self.pool.clone())
    }

    pub fn task_error_repository(&self) -> SqliteTaskErrorRepository {
        SqliteTaskErrorRepository::new(self.pool.clone())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub async fn setup_test_db() -> SqliteDatabase {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        };
        let db = SqliteDatabase::connect(&config).await.unwrap();
        db.migrate().await.unwrap();
        db
    }
}
