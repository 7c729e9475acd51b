//! 统一错误处理
//!
//! 派单核心的错误分类：
//!
//! | 变体 | 说明 | 是否重试 |
//! |------|------|----------|
//! | `NotFound` | 订单 / 骑手 / 派单不存在 | 否（事件已过期，处理器空操作） |
//! | `InvalidStateTransition` | 对终态或状态不符的订单操作 | 否 |
//! | `ExternalUnavailable` | 存储 / 队列 / 传输层故障 | 是（指数退避） |
//! | `Validation` | 坐标或 ID 格式错误 | 否 |
//! | `Internal` | 程序内部错误 | 否 |
//!
//! 抢单失败 (`RaceLost`) 不是错误，见 [`crate::dispatch::AcceptOutcome`]。

use crate::storage::StorageError;
use shared::order::OrderStatus;

/// 应用错误枚举
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    /// 资源不存在
    NotFound(String),

    #[error("Invalid state transition for order {order_id}: {detail}")]
    /// 状态流转不合法
    InvalidStateTransition { order_id: String, detail: String },

    #[error("External dependency unavailable: {0}")]
    /// 外部依赖不可用（可重试）
    ExternalUnavailable(String),

    #[error("Validation failed: {0}")]
    /// 验证失败
    Validation(String),

    #[error("Internal error: {0}")]
    /// 内部错误
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

// ========== Helper Constructors ==========

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn order_not_found(order_id: &str) -> Self {
        Self::NotFound(format!("order {}", order_id))
    }

    pub fn courier_not_found(courier_id: &str) -> Self {
        Self::NotFound(format!("courier {}", courier_id))
    }

    pub fn invalid_state(order_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            order_id: order_id.into(),
            detail: detail.into(),
        }
    }

    /// `from -> to` is not allowed
    pub fn invalid_transition(order_id: &str, from: OrderStatus, to: OrderStatus) -> Self {
        Self::invalid_state(order_id, format!("{} -> {} is not allowed", from, to))
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ExternalUnavailable(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// 是否可重试（仅外部依赖故障）
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::ExternalUnavailable(_))
    }

    /// 触发事件已过期：处理器应当空操作而不是重试
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            AppError::NotFound(_) | AppError::InvalidStateTransition { .. }
        )
    }
}

impl From<StorageError> for AppError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::OrderNotFound(id) => AppError::order_not_found(&id),
            StorageError::CourierNotFound(id) => AppError::courier_not_found(&id),
            StorageError::Serialization(e) => {
                tracing::error!(error = %e, "Corrupted record in dispatch storage");
                AppError::Internal(format!("Serialization error: {}", e))
            }
            other => AppError::ExternalUnavailable(other.to_string()),
        }
    }
}
