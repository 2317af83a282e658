//! 配置管理
//!
//! 默认值 -> TOML 文件 -> `ARCHIVIST_` 环境变量，逐层覆盖后统一验证。

pub mod models;

pub use models::*;
