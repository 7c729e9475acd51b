//! Shared record types for order dispatch

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Order Status
// ============================================================================

/// 订单状态
///
/// ```text
/// READY_FOR_PICKUP ──► ASSIGNED ──► PICKED_UP ──► OUT_FOR_DELIVERY ──► DELIVERED
///        │                │             │                │
///        └────────────────┴─────────────┴────────────────┴──► CANCELLED
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// 已出餐，等待骑手接单
    ReadyForPickup,
    /// 已分配骑手
    Assigned,
    /// 骑手已取餐
    PickedUp,
    /// 配送中
    OutForDelivery,
    /// 已送达（终态）
    Delivered,
    /// 已取消（终态）
    Cancelled,
}

impl OrderStatus {
    /// 是否终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// 骑手是否正在配送途中（用于 ETA 计算）
    pub fn is_in_delivery(&self) -> bool {
        matches!(self, OrderStatus::PickedUp | OrderStatus::OutForDelivery)
    }

    /// 正向流转的下一状态
    ///
    /// `CANCELLED` is not part of the forward chain; it is reachable from any
    /// non-terminal status and checked separately.
    pub fn next(&self) -> Option<OrderStatus> {
        match self {
            OrderStatus::ReadyForPickup => Some(OrderStatus::Assigned),
            OrderStatus::Assigned => Some(OrderStatus::PickedUp),
            OrderStatus::PickedUp => Some(OrderStatus::OutForDelivery),
            OrderStatus::OutForDelivery => Some(OrderStatus::Delivered),
            OrderStatus::Delivered | OrderStatus::Cancelled => None,
        }
    }

    /// 检查状态流转是否合法
    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == OrderStatus::Cancelled || self.next() == Some(to)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::ReadyForPickup => write!(f, "READY_FOR_PICKUP"),
            OrderStatus::Assigned => write!(f, "ASSIGNED"),
            OrderStatus::PickedUp => write!(f, "PICKED_UP"),
            OrderStatus::OutForDelivery => write!(f, "OUT_FOR_DELIVERY"),
            OrderStatus::Delivered => write!(f, "DELIVERED"),
            OrderStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

// ============================================================================
// Geo
// ============================================================================

/// 经纬度坐标
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Latitude within [-90, 90], longitude within [-180, 180], both finite
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

// ============================================================================
// Order
// ============================================================================

/// 订单记录（由外部下单流程创建，本核心只读取并条件更新 status / rider_id）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: String,
    pub status: OrderStatus,
    pub vendor_id: String,
    pub customer_id: String,
    /// 已分配骑手（每轮分配只能从 None 变为 Some 一次）
    #[serde(default)]
    pub rider_id: Option<String>,
    pub delivery_address: GeoPoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,

    // === Timestamps (Unix millis) ===
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picked_up_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_for_delivery_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<i64>,
    /// 分配超时后转人工的时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<i64>,
}

impl Order {
    /// 创建一个待取餐订单
    pub fn ready(
        id: impl Into<String>,
        vendor_id: impl Into<String>,
        customer_id: impl Into<String>,
        delivery_address: GeoPoint,
    ) -> Self {
        let now = crate::util::now_millis();
        Self {
            id: id.into(),
            status: OrderStatus::ReadyForPickup,
            vendor_id: vendor_id.into(),
            customer_id: customer_id.into(),
            rider_id: None,
            delivery_address,
            cancellation_reason: None,
            created_at: now,
            ready_at: Some(now),
            assigned_at: None,
            picked_up_at: None,
            out_for_delivery_at: None,
            delivered_at: None,
            cancelled_at: None,
            escalated_at: None,
        }
    }

    /// Ready, unassigned and not handed over to manual assignment
    pub fn is_waiting_for_rider(&self) -> bool {
        self.status == OrderStatus::ReadyForPickup
            && self.rider_id.is_none()
            && self.escalated_at.is_none()
    }

    /// Stamp the timestamp that belongs to `status`
    pub fn stamp(&mut self, status: OrderStatus, at: i64) {
        match status {
            OrderStatus::ReadyForPickup => self.ready_at = Some(at),
            OrderStatus::Assigned => self.assigned_at = Some(at),
            OrderStatus::PickedUp => self.picked_up_at = Some(at),
            OrderStatus::OutForDelivery => self.out_for_delivery_at = Some(at),
            OrderStatus::Delivered => self.delivered_at = Some(at),
            OrderStatus::Cancelled => self.cancelled_at = Some(at),
        }
    }
}

// ============================================================================
// Courier
// ============================================================================

/// 骑手记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Courier {
    pub id: String,
    pub is_online: bool,
    /// 是否可接单（持有进行中订单时为 false）
    pub is_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_lng: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_updated_at: Option<i64>,
    /// 推送令牌
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_token: Option<String>,
}

impl Courier {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_online: false,
            is_available: true,
            current_lat: None,
            current_lng: None,
            location_updated_at: None,
            push_token: None,
        }
    }

    pub fn with_push_token(mut self, token: impl Into<String>) -> Self {
        self.push_token = Some(token.into());
        self
    }

    /// Online and free to take a new order
    pub fn can_take_orders(&self) -> bool {
        self.is_online && self.is_available
    }

    pub fn position(&self) -> Option<GeoPoint> {
        match (self.current_lat, self.current_lng) {
            (Some(lat), Some(lng)) => Some(GeoPoint::new(lat, lng)),
            _ => None,
        }
    }
}

// ============================================================================
// Timeouts
// ============================================================================

/// 超时任务类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// 派单窗口：无人接单则转人工
    RiderAssignment,
    /// 取餐窗口：未取餐则自动取消
    Pickup,
    /// 配送窗口（暂无处理策略）
    Delivery,
}

impl TimeoutKind {
    pub const ALL: [TimeoutKind; 3] = [
        TimeoutKind::RiderAssignment,
        TimeoutKind::Pickup,
        TimeoutKind::Delivery,
    ];
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::RiderAssignment => write!(f, "rider_assignment"),
            TimeoutKind::Pickup => write!(f, "pickup"),
            TimeoutKind::Delivery => write!(f, "delivery"),
        }
    }
}

// ============================================================================
// Location
// ============================================================================

/// 骑手位置采样
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationSample {
    pub rider_id: String,
    pub lat: f64,
    pub lng: f64,
    /// Unix millis
    pub timestamp: i64,
}

impl LocationSample {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses_reject_all_transitions() {
        for to in [
            OrderStatus::ReadyForPickup,
            OrderStatus::Assigned,
            OrderStatus::Cancelled,
            OrderStatus::Delivered,
        ] {
            assert!(!OrderStatus::Delivered.can_transition_to(to));
            assert!(!OrderStatus::Cancelled.can_transition_to(to));
        }
    }

    #[test]
    fn test_forward_chain_and_cancel() {
        assert!(OrderStatus::ReadyForPickup.can_transition_to(OrderStatus::Assigned));
        assert!(OrderStatus::Assigned.can_transition_to(OrderStatus::PickedUp));
        assert!(OrderStatus::PickedUp.can_transition_to(OrderStatus::OutForDelivery));
        assert!(OrderStatus::OutForDelivery.can_transition_to(OrderStatus::Delivered));
        assert!(OrderStatus::OutForDelivery.can_transition_to(OrderStatus::Cancelled));

        // No skipping
        assert!(!OrderStatus::ReadyForPickup.can_transition_to(OrderStatus::PickedUp));
        assert!(!OrderStatus::Assigned.can_transition_to(OrderStatus::Delivered));
    }

    #[test]
    fn test_status_serde_format() {
        let json = serde_json::to_string(&OrderStatus::ReadyForPickup).unwrap();
        assert_eq!(json, "\"READY_FOR_PICKUP\"");
        let parsed: OrderStatus = serde_json::from_str("\"OUT_FOR_DELIVERY\"").unwrap();
        assert_eq!(parsed, OrderStatus::OutForDelivery);
    }

    #[test]
    fn test_geo_point_validation() {
        assert!(GeoPoint::new(31.23, 121.47).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -180.5).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }
}
