//! 工具模块 - 通用工具函数和类型
//!
//! # 内容
//!
//! - [`AppError`] - 应用错误类型
//! - [`retry`] - 指数退避重试
//! - 日志等工具

pub mod error;
pub mod logger;
pub mod retry;

pub use error::{AppError, AppResult};
pub use retry::{RetryPolicy, retry_with_backoff};
