pub mod app_config;
pub mod database;
pub mod dispatcher_analyst;
pub mod observability;

pub use app_config::AppConfig;
pub use database::{DatabaseBackend, DatabaseConfig};
pub use dispatcher_analyst::{AnalystConfig, DispatcherConfig};
pub use observability::ObservabilityConfig;
