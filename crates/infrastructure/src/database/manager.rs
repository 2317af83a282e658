use std::sync::Arc;

use archivist_core::{DatabaseBackend, DatabaseConfig, SchedulerError, SchedulerResult};
use archivist_domain::repositories::{
    AnalystRepository, JobRepository, TaskErrorRepository, TaskRepository,
};
use tracing::info;

use super::memory::InMemoryStore;
use super::sqlite::SqliteDatabase;

/// 存储后端
enum Backend {
    Memory(InMemoryStore),
    Sqlite(SqliteDatabase),
}

/// 一组共享同一存储的仓储
#[derive(Clone)]
pub struct RepositorySet {
    pub jobs: Arc<dyn JobRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub analysts: Arc<dyn AnalystRepository>,
    pub task_errors: Arc<dyn TaskErrorRepository>,
}

impl RepositorySet {
    /// 基于一个新的内存存储
    pub fn in_memory() -> Self {
        Self::from_memory(&InMemoryStore::new())
    }

    pub fn from_memory(store: &InMemoryStore) -> Self {
        Self {
            jobs: Arc::new(store.job_repository()),
            tasks: Arc::new(store.task_repository()),
            analysts: Arc::new(store.analyst_repository()),
            task_errors: Arc::new(store.task_error_repository()),
        }
    }

    pub fn from_sqlite(db: &SqliteDatabase) -> Self {
        Self {
            jobs: Arc::new(db.job_repository()),
            tasks: Arc::new(db.task_repository()),
            analysts: Arc::new(db.analyst_repository()),
            task_errors: Arc::new(db.task_error_repository()),
        }
    }
}

/// 根据配置选择存储后端并提供仓储
pub struct DatabaseManager {
    backend: Backend,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let backend = match config.backend() {
            Some(DatabaseBackend::Memory) => {
                info!("使用内存存储");
                Backend::Memory(InMemoryStore::new())
            }
            Some(DatabaseBackend::Sqlite) => {
                let db = SqliteDatabase::connect(config).await?;
                db.migrate().await?;
                Backend::Sqlite(db)
            }
            None => {
                return Err(SchedulerError::Configuration(format!(
                    "不支持的数据库URL: {}",
                    config.url
                )))
            }
        };
        Ok(Self { backend })
    }

    pub fn backend(&self) -> DatabaseBackend {
        match self.backend {
            Backend::Memory(_) => DatabaseBackend::Memory,
            Backend::Sqlite(_) => DatabaseBackend::Sqlite,
        }
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        match &self.backend {
            Backend::Memory(_) => Ok(()),
            Backend::Sqlite(db) => db.health_check().await,
        }
    }

    pub async fn close(&self) {
        if let Backend::Sqlite(db) = &self.backend {
            db.close().await;
        }
    }

    pub fn repositories(&self) -> RepositorySet {
        match &self.backend {
            Backend::Memory(store) => RepositorySet::from_memory(store),
            Backend::Sqlite(db) => RepositorySet::from_sqlite(db),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend() {
        let manager = DatabaseManager::new(&DatabaseConfig::default()).await.unwrap();
        assert_eq!(manager.backend(), DatabaseBackend::Memory);
        assert!(manager.health_check().await.is_ok());
        let _repos = manager.repositories();
    }

    #[tokio::test]
    async fn test_sqlite_backend_is_migrated() {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        };
        let manager = DatabaseManager::new(&config).await.unwrap();
        assert_eq!(manager.backend(), DatabaseBackend::Sqlite);

        let repos = manager.repositories();
        let jobs = repos
            .jobs
            .list(&archivist_domain::entities::JobFilter::default())
            .await
            .unwrap();
        assert!(jobs.is_empty());
        manager.close().await;
    }

    #[tokio::test]
    async fn test_unsupported_url() {
        let config = DatabaseConfig {
            url: "postgres://localhost/archivist".to_string(),
            ..Default::default()
        };
        assert!(DatabaseManager::new(&config).await.is_err());
    }
}
