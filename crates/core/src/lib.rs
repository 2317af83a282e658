pub mod config;
pub mod errors;
pub mod logging;

pub use config::{
    AnalystConfig, AppConfig, DatabaseBackend, DatabaseConfig, DispatcherConfig,
    ObservabilityConfig,
};
pub use errors::*;
pub use logging::init_logging;
