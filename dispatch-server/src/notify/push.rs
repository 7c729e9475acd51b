//! 推送网关
//!
//! [`HttpPushGateway`] POSTs JSON to the configured gateway URL;
//! [`LogPushGateway`] is used when no URL is configured.

use async_trait::async_trait;
use serde::Serialize;
use shared::message::Notification;

use crate::utils::{AppError, AppResult};

/// 一条推送
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushMessage {
    pub token: String,
    pub title: String,
    pub body: String,
    /// 原始通知 (客户端打开推送后用于跳转)
    pub data: Notification,
}

impl PushMessage {
    pub fn new(token: impl Into<String>, notification: &Notification) -> Self {
        let (title, body) = notification.push_content();
        Self {
            token: token.into(),
            title,
            body,
            data: notification.clone(),
        }
    }
}

/// Push notification sender
///
/// Transient failures (connection errors, 5xx) must be reported as
/// `ExternalUnavailable` so callers can retry them.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, push: &PushMessage) -> AppResult<()>;
}

/// HTTP push gateway
pub struct HttpPushGateway {
    url: String,
    client: reqwest::Client,
}

impl HttpPushGateway {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send(&self, push: &PushMessage) -> AppResult<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(push)
            .send()
            .await
            .map_err(|e| AppError::unavailable(format!("Push gateway connection failed: {}", e)))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let text = resp.text().await.unwrap_or_default();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(AppError::unavailable(format!(
                "Push gateway returned {} - {}",
                status, text
            )))
        } else {
            Err(AppError::validation(format!(
                "Push rejected: {} - {}",
                status, text
            )))
        }
    }
}

/// Push gateway that only logs
#[derive(Debug, Default)]
pub struct LogPushGateway;

#[async_trait]
impl PushGateway for LogPushGateway {
    async fn send(&self, push: &PushMessage) -> AppResult<()> {
        tracing::info!(
            event = push.data.kind(),
            order_id = %push.data.order_id(),
            title = %push.title,
            "Push (no gateway configured): {}",
            push.body
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_message_uses_notification_content() {
        let notification = Notification::OrderCancelled {
            order_id: "o1".into(),
            reason: "pickup timeout".into(),
        };
        let push = PushMessage::new("tok", &notification);
        assert_eq!(push.title, "Order cancelled");
        assert!(push.body.contains("pickup timeout"));

        let json = serde_json::to_value(&push).unwrap();
        assert_eq!(json["data"]["event"], "order_cancelled");
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_retryable() {
        // Port 9 (discard) on localhost is not listening in test environments
        let gateway = HttpPushGateway::new("http://127.0.0.1:9/push");
        let notification = Notification::OrderAssigned {
            order_id: "o1".into(),
            rider_id: "r1".into(),
        };
        let err = gateway
            .send(&PushMessage::new("tok", &notification))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
