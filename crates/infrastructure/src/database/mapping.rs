//! SQLite 行映射的公共工具
//!
//! 时间以毫秒时间戳存储，UUID和集合类字段以文本存储。

use archivist_core::{SchedulerError, SchedulerResult};
use archivist_domain::entities::{AssetCounts, TaskState};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn millis(time: DateTime<Utc>) -> i64 {
        time.timestamp_millis()
    }

    pub fn opt_millis(time: Option<DateTime<Utc>>) -> Option<i64> {
        time.map(|t| t.timestamp_millis())
    }

    pub fn get_time(row: &SqliteRow, field_name: &str) -> SchedulerResult<DateTime<Utc>> {
        let millis: i64 = row.try_get(field_name)?;
        DateTime::from_timestamp_millis(millis).ok_or_else(|| {
            SchedulerError::Serialization(format!("无效的时间戳 {field_name}: {millis}"))
        })
    }

    pub fn get_opt_time(
        row: &SqliteRow,
        field_name: &str,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        let millis: Option<i64> = row.try_get(field_name)?;
        millis
            .map(|m| {
                DateTime::from_timestamp_millis(m).ok_or_else(|| {
                    SchedulerError::Serialization(format!("无效的时间戳 {field_name}: {m}"))
                })
            })
            .transpose()
    }

    pub fn parse_uuid(value: &str) -> SchedulerResult<Uuid> {
        Uuid::parse_str(value)
            .map_err(|e| SchedulerError::Serialization(format!("解析UUID失败 {value}: {e}")))
    }

    pub fn get_uuid(row: &SqliteRow, field_name: &str) -> SchedulerResult<Uuid> {
        let value: String = row.try_get(field_name)?;
        Self::parse_uuid(&value)
    }

    pub fn get_opt_uuid(row: &SqliteRow, field_name: &str) -> SchedulerResult<Option<Uuid>> {
        let value: Option<String> = row.try_get(field_name)?;
        value.as_deref().map(Self::parse_uuid).transpose()
    }

    pub fn get_json<T: DeserializeOwned>(row: &SqliteRow, field_name: &str) -> SchedulerResult<T> {
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str)
            .map_err(|e| SchedulerError::Serialization(format!("解析字段 {field_name} 失败: {e}")))
    }

    pub fn get_asset_counts(row: &SqliteRow) -> SchedulerResult<AssetCounts> {
        Ok(AssetCounts {
            created: row.try_get("asset_created")?,
            replaced: row.try_get("asset_replaced")?,
            warning: row.try_get("asset_warning")?,
            error: row.try_get("asset_error")?,
            total: row.try_get("asset_total")?,
        })
    }

    /// 作业表中保存该状态任务数的列
    pub fn counter_column(state: TaskState) -> &'static str {
        match state {
            TaskState::Waiting => "task_waiting",
            TaskState::Depend => "task_depend",
            TaskState::Queued => "task_queued",
            TaskState::Running => "task_running",
            TaskState::Success => "task_success",
            TaskState::Failure => "task_failure",
            TaskState::Skipped => "task_skipped",
        }
    }

    /// 生成 `?, ?, ?` 形式的占位符
    pub fn placeholders(count: usize) -> String {
        vec!["?"; count].join(", ")
    }
}
