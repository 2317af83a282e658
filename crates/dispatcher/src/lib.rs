//! 调度核心
//!
//! Analyst登记、任务分发、事件处理与后台检测，`DispatchController` 是对外入口。

pub mod analyst_reaper;
pub mod analyst_registry;
pub mod controller;
pub mod dispatch_queue;
pub mod event_handler;
pub mod event_processor;
pub mod job_service;
pub mod metrics;
pub mod orphan_detector;

pub use analyst_reaper::AnalystReaper;
pub use analyst_registry::AnalystRegistry;
pub use controller::DispatchController;
pub use dispatch_queue::{DispatchQueue, DispatchWorker};
pub use event_handler::{TaskCommand, TaskEventHandler};
pub use event_processor::EventProcessor;
pub use job_service::JobService;
pub use orphan_detector::OrphanDetector;
