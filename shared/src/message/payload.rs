use serde::{Deserialize, Serialize};
use std::fmt;

use crate::order::{GeoPoint, OrderStatus};

// ==================== Offer Withdrawal ====================

/// 派单撤回原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawReason {
    /// 已被其他骑手抢到
    TakenByOther,
    /// 订单已取消
    OrderCancelled,
    /// 派单窗口到期，转人工处理
    Escalated,
}

impl fmt::Display for WithdrawReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TakenByOther => write!(f, "taken_by_other"),
            Self::OrderCancelled => write!(f, "order_cancelled"),
            Self::Escalated => write!(f, "escalated"),
        }
    }
}

// ==================== ETA ====================

/// 配送距离与预计到达时间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtaUpdate {
    pub order_id: String,
    pub rider_id: String,
    /// 骑手到收货地址的大圆距离 (km)
    pub distance_km: f64,
    /// 预计剩余分钟数（至少 1）
    pub eta_minutes: u32,
    /// 预计到达时间 (Unix millis)
    pub estimated_arrival: i64,
    /// 骑手当前位置
    pub location: GeoPoint,
}

// ==================== Notifications ====================

/// 派单通知 - 所有实时推送的事件种类
///
/// Every kind is matched exhaustively by senders; there is no catch-all event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Notification {
    /// 新派单
    OfferCreated {
        order_id: String,
        vendor_id: String,
        delivery_address: GeoPoint,
        expires_at: i64,
        /// 第几轮派单（从 1 开始）
        round: u32,
    },
    /// 派单撤回
    OfferWithdrawn {
        order_id: String,
        reason: WithdrawReason,
    },
    /// 订单已分配骑手
    OrderAssigned { order_id: String, rider_id: String },
    /// 订单状态变化（取餐、配送、送达）
    OrderStatusChanged {
        order_id: String,
        status: OrderStatus,
        rider_id: Option<String>,
    },
    /// 订单已取消
    OrderCancelled { order_id: String, reason: String },
    /// 派单超时，需要人工分配
    AssignmentEscalated {
        order_id: String,
        reason: String,
        rounds: u32,
    },
    /// 距离 / ETA 更新
    EtaUpdated(EtaUpdate),
}

impl Notification {
    /// 事件名（用于日志）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OfferCreated { .. } => "offer_created",
            Self::OfferWithdrawn { .. } => "offer_withdrawn",
            Self::OrderAssigned { .. } => "order_assigned",
            Self::OrderStatusChanged { .. } => "order_status_changed",
            Self::OrderCancelled { .. } => "order_cancelled",
            Self::AssignmentEscalated { .. } => "assignment_escalated",
            Self::EtaUpdated(_) => "eta_updated",
        }
    }

    pub fn order_id(&self) -> &str {
        match self {
            Self::OfferCreated { order_id, .. }
            | Self::OfferWithdrawn { order_id, .. }
            | Self::OrderAssigned { order_id, .. }
            | Self::OrderStatusChanged { order_id, .. }
            | Self::OrderCancelled { order_id, .. }
            | Self::AssignmentEscalated { order_id, .. } => order_id,
            Self::EtaUpdated(eta) => &eta.order_id,
        }
    }

    /// A newer one for the same order makes the older one worthless
    /// (only ETA updates)
    pub fn coalesces(&self) -> bool {
        matches!(self, Self::EtaUpdated(_))
    }

    /// 推送标题和正文
    pub fn push_content(&self) -> (String, String) {
        match self {
            Self::OfferCreated { order_id, .. } => (
                "New delivery request".to_string(),
                format!("Order {} is ready for pickup", order_id),
            ),
            Self::OfferWithdrawn { order_id, reason } => (
                "Delivery request closed".to_string(),
                match reason {
                    WithdrawReason::TakenByOther => {
                        format!("Order {} was accepted by another rider", order_id)
                    }
                    WithdrawReason::OrderCancelled => format!("Order {} was cancelled", order_id),
                    WithdrawReason::Escalated => format!("Order {} is no longer available", order_id),
                },
            ),
            Self::OrderAssigned { order_id, .. } => (
                "Rider assigned".to_string(),
                format!("A rider is on the way to pick up order {}", order_id),
            ),
            Self::OrderStatusChanged {
                order_id, status, ..
            } => (
                "Order update".to_string(),
                match status {
                    OrderStatus::PickedUp => format!("Order {} has been picked up", order_id),
                    OrderStatus::OutForDelivery => {
                        format!("Order {} is out for delivery", order_id)
                    }
                    OrderStatus::Delivered => format!("Order {} has been delivered", order_id),
                    other => format!("Order {} is now {}", order_id, other),
                },
            ),
            Self::OrderCancelled { order_id, reason } => (
                "Order cancelled".to_string(),
                format!("Order {} was cancelled: {}", order_id, reason),
            ),
            Self::AssignmentEscalated { order_id, .. } => (
                "Manual assignment needed".to_string(),
                format!("No rider accepted order {}", order_id),
            ),
            Self::EtaUpdated(eta) => (
                "Delivery update".to_string(),
                format!(
                    "Order {} arrives in about {} min",
                    eta.order_id, eta.eta_minutes
                ),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_wire_format() {
        let n = Notification::OrderAssigned {
            order_id: "o1".to_string(),
            rider_id: "r1".to_string(),
        };
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["event"], "order_assigned");
        assert_eq!(value["data"]["rider_id"], "r1");
    }

    #[test]
    fn test_eta_push_content_mentions_minutes() {
        let n = Notification::EtaUpdated(EtaUpdate {
            order_id: "o9".to_string(),
            rider_id: "r1".to_string(),
            distance_km: 2.5,
            eta_minutes: 5,
            estimated_arrival: 0,
            location: GeoPoint::new(0.0, 0.0),
        });
        let (_, body) = n.push_content();
        assert!(body.contains("5 min"));
        assert_eq!(n.order_id(), "o9");
        assert!(n.coalesces());
        assert!(!Notification::OrderAssigned {
            order_id: "o9".to_string(),
            rider_id: "r1".to_string(),
        }
        .coalesces());
    }
}
