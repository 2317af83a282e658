//! # Archivist Testing Utils
//!
//! 各crate共用的测试工具：测试数据构建器与时间辅助方法。
//!
//! ```toml
//! [dev-dependencies]
//! archivist-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;

pub use builders::*;
pub use helpers::*;
