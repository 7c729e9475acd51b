//! 消息总线核心实现
//!
//! # 消息流
//!
//! ```text
//! NotificationRouter ──▶ publish() ──▶ tx ──┬──▶ subscribe_topic("order:42")
//!                                           ├──▶ subscribe_topic("rider:r1")
//!                                           └──▶ subscribe()  (all topics)
//! ```
//!
//! The bus only carries live traffic. Delivery to disconnected subscribers
//! is handled by the router's pending queue.

use async_trait::async_trait;
use shared::message::{BusMessage, Topic};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::Broadcaster;
use crate::utils::{AppError, AppResult};

/// 消息总线 - 按主题广播实时通知
#[derive(Debug, Clone)]
pub struct MessageBus {
    /// 服务器到订阅者的广播通道
    tx: broadcast::Sender<BusMessage>,
    /// 关闭信号令牌
    shutdown_token: CancellationToken,
}

impl MessageBus {
    /// 创建默认容量 (1024) 的消息总线
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// 创建指定容量的消息总线
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// 发布消息，返回收到消息的订阅者数量
    ///
    /// No live subscriber is not an error: the message simply has no reader
    /// on this node.
    pub fn send(&self, msg: BusMessage) -> AppResult<usize> {
        if self.shutdown_token.is_cancelled() {
            return Err(AppError::unavailable("message bus is shut down"));
        }
        match self.tx.send(msg) {
            Ok(receivers) => Ok(receivers),
            Err(broadcast::error::SendError(msg)) => {
                tracing::trace!(topic = %msg.topic, "No live subscribers");
                Ok(0)
            }
        }
    }

    /// 订阅所有主题
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    /// 订阅单个主题
    pub fn subscribe_topic(&self, topic: Topic) -> TopicSubscription {
        TopicSubscription {
            topic,
            rx: self.tx.subscribe(),
        }
    }

    /// 当前订阅者数量
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// 获取关闭令牌 (用于监控关闭信号)
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    /// 优雅关闭消息总线
    pub fn shutdown(&self) {
        tracing::info!("Shutting down message bus");
        self.shutdown_token.cancel();
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broadcaster for MessageBus {
    async fn publish(&self, message: BusMessage) -> AppResult<()> {
        self.send(message).map(|_| ())
    }
}

/// Receiver filtered to one topic
pub struct TopicSubscription {
    topic: Topic,
    rx: broadcast::Receiver<BusMessage>,
}

impl TopicSubscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next message on this topic; `None` once the bus is dropped
    ///
    /// A lagging subscriber skips what it missed and keeps reading.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if msg.topic == self.topic => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(topic = %self.topic, skipped, "Topic subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) if msg.topic == self.topic => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(topic = %self.topic, skipped, "Topic subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }
}
