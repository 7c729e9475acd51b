//! 超时模块
//!
//! - [`TimeoutScheduler`] - arm / disarm
//! - [`JobQueue`] - 持久化延迟任务队列
//! - [`TimeoutWorker`] - 后台轮询并执行到期任务

pub mod queue;
pub mod scheduler;
pub mod worker;

pub use queue::{JobQueue, RetryDecision};
pub use scheduler::{TimeoutHandle, TimeoutHandler, TimeoutScheduler};
pub use worker::{PollSummary, TimeoutWorker, report_dead_letters};
