//! 通知模块
//!
//! - [`NotificationRouter`] - 按目标路由通知，离线暂存与重放
//! - [`SessionRegistry`] - 连接计数
//! - [`PushGateway`] - 推送网关 (HTTP / 日志)

pub mod push;
pub mod router;
pub mod sessions;

pub use push::{HttpPushGateway, LogPushGateway, PushGateway, PushMessage};
pub use router::{Delivery, NotificationRouter};
pub use sessions::SessionRegistry;

use shared::message::Topic;

/// 通知目标
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Courier(String),
    Customer(String),
    Vendor(String),
    Admin,
    /// 所有骑手
    AllCouriers,
    /// 订阅某个订单的所有客户端
    Order(String),
}

impl Target {
    pub fn topic(&self) -> Topic {
        match self {
            Target::Courier(id) => Topic::Rider(id.clone()),
            Target::Customer(id) => Topic::Customer(id.clone()),
            Target::Vendor(id) => Topic::Vendor(id.clone()),
            Target::Admin => Topic::Admin,
            Target::AllCouriers => Topic::AllRiders,
            Target::Order(id) => Topic::Order(id.clone()),
        }
    }
}
