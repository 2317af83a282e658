pub mod entities;
pub mod events;
pub mod repositories;
pub mod services;
pub mod task_dependency_service;
pub mod value_objects;

// SQLx 实现（仅在启用 sqlx-support feature 时编译）
#[cfg(feature = "sqlx-support")]
pub mod sqlx_impls;

pub use archivist_core::{SchedulerError, SchedulerResult};
pub use entities::*;
pub use events::*;
pub use repositories::*;
pub use services::*;
pub use task_dependency_service::*;
pub use value_objects::*;
