use std::net::SocketAddr;

use anyhow::{Context, Result};
use archivist_core::AppConfig;
use archivist_dispatcher::DispatchController;
use archivist_infrastructure::DatabaseManager;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::broadcast;
use tracing::info;

/// 主应用程序
pub struct Application {
    config: AppConfig,
    database: DatabaseManager,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序，数据库: {}", config.database.url);

        let database = DatabaseManager::new(&config.database)
            .await
            .context("初始化存储失败")?;
        database.health_check().await.context("存储健康检查失败")?;

        if config.observability.metrics_enabled {
            install_metrics_exporter(&config.observability.metrics_listen_address)?;
        }

        Ok(Self { config, database })
    }

    /// 运行调度核心直到收到停止信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let controller = DispatchController::start(
            self.database.repositories(),
            &self.config,
            shutdown_rx.resubscribe(),
        );

        let _ = shutdown_rx.recv().await;
        info!("开始停止调度核心");

        controller.wait_stopped().await;
        self.database.close().await;
        info!("调度核心已停止");
        Ok(())
    }
}

fn install_metrics_exporter(listen_address: &str) -> Result<()> {
    let addr: SocketAddr = listen_address
        .parse()
        .with_context(|| format!("指标监听地址格式无效: {listen_address}"))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus导出器失败: {e}"))?;

    info!("Prometheus指标导出器已启动: {}", addr);
    Ok(())
}
