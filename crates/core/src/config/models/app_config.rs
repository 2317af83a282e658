use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig,
    dispatcher_analyst::{AnalystConfig, DispatcherConfig},
    observability::ObservabilityConfig,
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub analyst: AnalystConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: ARCHIVIST_, nested keys joined by `__`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults =
            ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/archivist.toml",
                "archivist.toml",
                "/etc/archivist/config.toml",
            ];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        // ARCHIVIST_DISPATCHER__MAX_RUN_COUNT=5
        builder = builder.add_source(
            Environment::with_prefix("ARCHIVIST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.dispatcher.validate().context("Dispatcher配置验证失败")?;
        self.analyst.validate().context("Analyst配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatcher.max_run_count, 3);
        assert_eq!(config.analyst.liveness_timeout_seconds, 90);
    }

    #[test]
    fn test_from_toml_partial_sections() {
        let toml_str = r#"
            [dispatcher]
            max_run_count = 5
            candidate_batch_size = 20
            event_workers = 4
            event_queue_capacity = 64
            run_timeout_seconds = 120
            orphan_check_interval_seconds = 10
        "#;

        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.dispatcher.max_run_count, 5);
        assert_eq!(config.dispatcher.event_workers, 4);
        assert_eq!(config.database.url, "memory://");
    }

    #[test]
    fn test_invalid_database_url_rejected() {
        let toml_str = r#"
            [database]
            url = "postgresql://localhost/archivist"
            max_connections = 5
            min_connections = 1
            connection_timeout_seconds = 30
            idle_timeout_seconds = 600
        "#;

        assert!(AppConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_toml_roundtrip_keeps_values() {
        let mut config = AppConfig::default();
        config.analyst.reap_interval_seconds = 7;
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.analyst.reap_interval_seconds, 7);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[analyst]\nliveness_timeout_seconds = 45\nreap_interval_seconds = 5\nauto_cleanup = false\ncleanup_threshold_seconds = 60"
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.analyst.liveness_timeout_seconds, 45);
        assert!(!config.analyst.auto_cleanup);
        assert_eq!(config.dispatcher.max_run_count, 3);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/archivist.toml")).is_err());
    }
}
