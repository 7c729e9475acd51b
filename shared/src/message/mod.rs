//! 实时消息类型定义
//!
//! 这些类型在 dispatch-server 和客户端之间共享，描述实时传输层上的
//! 主题寻址 ([`Topic`]) 和消息外壳 ([`BusMessage`])。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub mod payload;
pub use payload::*;

/// 广播给所有骑手的主题名
pub const ALL_RIDERS_TOPIC: &str = "riders";
/// 管理后台主题名
pub const ADMIN_TOPIC: &str = "admin";

/// 传输层主题
///
/// | Topic | Key |
/// |-------|-----|
/// | Order | `order:{id}` |
/// | Rider | `rider:{id}` |
/// | Customer | `customer:{id}` |
/// | Vendor | `vendor:{id}` |
/// | Admin | `admin` |
/// | AllRiders | `riders` |
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Topic {
    Order(String),
    Rider(String),
    Customer(String),
    Vendor(String),
    Admin,
    AllRiders,
}

impl Topic {
    /// 主题字符串
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// 个人主题（订阅者可能离线，需要离线暂存）
    pub fn is_personal(&self) -> bool {
        matches!(self, Topic::Rider(_) | Topic::Customer(_) | Topic::Vendor(_))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Order(id) => write!(f, "order:{}", id),
            Topic::Rider(id) => write!(f, "rider:{}", id),
            Topic::Customer(id) => write!(f, "customer:{}", id),
            Topic::Vendor(id) => write!(f, "vendor:{}", id),
            Topic::Admin => write!(f, "{}", ADMIN_TOPIC),
            Topic::AllRiders => write!(f, "{}", ALL_RIDERS_TOPIC),
        }
    }
}

/// Topic key that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid topic: {0}")]
pub struct TopicParseError(pub String);

impl FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ADMIN_TOPIC => return Ok(Topic::Admin),
            ALL_RIDERS_TOPIC => return Ok(Topic::AllRiders),
            _ => {}
        }

        let (prefix, id) = s
            .split_once(':')
            .filter(|(_, id)| !id.is_empty())
            .ok_or_else(|| TopicParseError(s.to_string()))?;
        let id = id.to_string();
        match prefix {
            "order" => Ok(Topic::Order(id)),
            "rider" => Ok(Topic::Rider(id)),
            "customer" => Ok(Topic::Customer(id)),
            "vendor" => Ok(Topic::Vendor(id)),
            _ => Err(TopicParseError(s.to_string())),
        }
    }
}

/// 传输层消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// 消息 ID（用于客户端去重）
    pub id: Uuid,
    pub topic: Topic,
    pub notification: Notification,
    /// 创建时间 (Unix millis)
    pub timestamp: i64,
}

impl BusMessage {
    pub fn new(topic: Topic, notification: Notification) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic,
            notification,
            timestamp: crate::util::now_millis(),
        }
    }

    /// 序列化为二进制
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// 从二进制解析
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_keys() {
        assert_eq!(Topic::Order("42".into()).key(), "order:42");
        assert_eq!(Topic::Rider("r1".into()).key(), "rider:r1");
        assert_eq!(Topic::AllRiders.key(), "riders");
        assert_eq!(Topic::Admin.key(), "admin");
    }

    #[test]
    fn test_topic_parse() {
        assert_eq!("vendor:v7".parse::<Topic>(), Ok(Topic::Vendor("v7".into())));
        assert_eq!("riders".parse::<Topic>(), Ok(Topic::AllRiders));
        assert!("rider:".parse::<Topic>().is_err());
        assert!("courier:1".parse::<Topic>().is_err());
        assert!("nonsense".parse::<Topic>().is_err());
    }

    #[test]
    fn test_personal_topics() {
        assert!(Topic::Customer("c".into()).is_personal());
        assert!(!Topic::Order("o".into()).is_personal());
        assert!(!Topic::AllRiders.is_personal());
    }
}
