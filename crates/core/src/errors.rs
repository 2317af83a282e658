use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("作业未找到: {id}")]
    JobNotFound { id: String },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("Analyst未找到: {endpoint}")]
    AnalystNotFound { endpoint: String },

    #[error("无效的状态: {0}")]
    InvalidState(String),

    #[error("数据验证失败: {0}")]
    Validation(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("通道已关闭: {0}")]
    ChannelClosed(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn job_not_found(id: impl ToString) -> Self {
        Self::JobNotFound { id: id.to_string() }
    }

    pub fn task_not_found(id: impl ToString) -> Self {
        Self::TaskNotFound { id: id.to_string() }
    }

    pub fn analyst_not_found(endpoint: impl Into<String>) -> Self {
        Self::AnalystNotFound {
            endpoint: endpoint.into(),
        }
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::JobNotFound { .. }
                | SchedulerError::TaskNotFound { .. }
                | SchedulerError::AnalystNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(SchedulerError::task_not_found("t-1").is_not_found());
        assert!(SchedulerError::analyst_not_found("10.0.0.1:5000").is_not_found());
        assert!(!SchedulerError::validation("bad").is_not_found());
    }

    #[test]
    fn test_serde_error_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let converted: SchedulerError = err.into();
        assert!(matches!(converted, SchedulerError::Serialization(_)));
    }
}
