//! 测试辅助方法

use chrono::{DateTime, Utc};

pub struct TestEnv;

impl TestEnv {
    /// 相对当前时间偏移若干秒的时间点，用于构造过期心跳
    pub fn timestamp_with_offset(offset_seconds: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(offset_seconds)
    }
}
