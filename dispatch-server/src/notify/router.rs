//! 通知路由
//!
//! ```text
//! send(target, notification)
//!   │
//!   ├─ topic-wide (order / admin / riders) ──────────▶ publish (retry)
//!   ├─ personal + reachable ─────────────────────────▶ publish (retry)
//!   │                              exhausted ─┐
//!   └─ personal + offline ─────────────────────┴─────▶ pending table
//!                                                    └─▶ push (couriers)
//! ```
//!
//! The first connection of a target replays its pending table in order.
//! While that replay runs, sends to the topic are parked behind it and
//! drained by the same replay, so a live message never overtakes the backlog.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shared::message::{BusMessage, Notification, Topic};

use super::push::{PushGateway, PushMessage};
use super::sessions::SessionRegistry;
use super::Target;
use crate::message::Broadcaster;
use crate::storage::DispatchStorage;
use crate::utils::{AppResult, RetryPolicy, retry_with_backoff};

/// Publish retries: 3 attempts, 200ms base
const PUBLISH_RETRY: RetryPolicy =
    RetryPolicy::new(3, Duration::from_millis(200), Duration::from_secs(2));
/// Push retries: 3 attempts, 500ms base
const PUSH_RETRY: RetryPolicy =
    RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(5));

/// How a notification left the router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Published on the live transport
    Live,
    /// Stored for replay on reconnect
    Parked,
}

pub struct NotificationRouter {
    storage: DispatchStorage,
    broadcaster: Arc<dyn Broadcaster>,
    push: Arc<dyn PushGateway>,
    sessions: SessionRegistry,
    /// Topics whose pending queue is being replayed
    ///
    /// Session changes, the replaying check and parking happen under this
    /// lock, so a message is either parked before the replay's final read
    /// or sent live after the gate is lifted.
    replaying: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for NotificationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRouter")
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl NotificationRouter {
    pub fn new(
        storage: DispatchStorage,
        broadcaster: Arc<dyn Broadcaster>,
        push: Arc<dyn PushGateway>,
    ) -> Self {
        Self {
            storage,
            broadcaster,
            push,
            sessions: SessionRegistry::new(),
            replaying: Mutex::new(HashSet::new()),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// True while the first connection of `target` is draining its backlog
    pub fn is_replaying(&self, target: &Target) -> bool {
        self.replaying.lock().contains(&target.topic().key())
    }

    pub fn is_reachable(&self, target: &Target) -> bool {
        let topic = target.topic();
        !topic.is_personal() || self.sessions.is_reachable(&topic.key())
    }

    /// Route one notification to one target
    pub async fn send(&self, target: &Target, notification: Notification) -> AppResult<Delivery> {
        let topic = target.topic();
        let key = topic.key();
        let personal = topic.is_personal();
        let message = BusMessage::new(topic, notification);

        let (live, behind_replay) = {
            let replaying = self.replaying.lock();
            let behind_replay = personal && replaying.contains(&key);
            let live = !personal || (self.sessions.is_reachable(&key) && !behind_replay);
            if !live {
                self.storage.push_pending_notification(&key, &message)?;
            }
            (live, behind_replay)
        };

        if live {
            match self.publish_with_retry(message.clone()).await {
                Ok(()) => {
                    tracing::debug!(
                        topic = %key,
                        event = message.notification.kind(),
                        order_id = %message.notification.order_id(),
                        "Notification published"
                    );
                    return Ok(Delivery::Live);
                }
                Err(e) => {
                    tracing::error!(
                        topic = %key,
                        event = message.notification.kind(),
                        error = %e,
                        "Publish failed after retries, parking notification"
                    );
                    self.storage.push_pending_notification(&key, &message)?;
                }
            }
        }

        tracing::debug!(
            topic = %key,
            event = message.notification.kind(),
            order_id = %message.notification.order_id(),
            behind_replay,
            "Notification parked"
        );

        // A replaying courier is connected and gets it from the replay
        if !behind_replay {
            if let Target::Courier(courier_id) = target {
                self.push_to_courier(courier_id, &message.notification).await;
            }
        }
        Ok(Delivery::Parked)
    }

    /// Send to several targets; failures are logged per target
    ///
    /// Used after a state change has already been committed, where a
    /// notification failure must not undo the change.
    pub async fn notify_all(&self, targets: &[Target], notification: Notification) {
        for target in targets {
            if let Err(e) = self.send(target, notification.clone()).await {
                tracing::error!(
                    topic = %target.topic(),
                    event = notification.kind(),
                    order_id = %notification.order_id(),
                    error = %e,
                    "Failed to route notification"
                );
            }
        }
    }

    /// A client connected for `target`; the first connection replays the
    /// pending queue. Returns the number of replayed notifications.
    ///
    /// A first connection that finds a replay still running (reconnect
    /// during replay) leaves the draining to it and returns 0.
    pub async fn connect(&self, target: &Target) -> AppResult<usize> {
        let key = target.topic().key();
        {
            let mut replaying = self.replaying.lock();
            if !self.sessions.connect(&key) || !replaying.insert(key.clone()) {
                return Ok(0);
            }
        }
        tracing::info!(topic = %key, "Target connected");
        let result = self.replay_pending(&key).await;
        if result.is_err() {
            self.replaying.lock().remove(&key);
        }
        result
    }

    /// A client disconnected; returns true if it was the last connection
    pub fn disconnect(&self, target: &Target) -> bool {
        let key = target.topic().key();
        let last = self.sessions.disconnect(&key);
        if last {
            tracing::info!(topic = %key, "Target disconnected");
        }
        last
    }

    /// Replay parked notifications in order, removing each once published
    ///
    /// Re-reads the queue until it is empty, then lifts the gate under the
    /// same lock. Stops at the first failure; the rest stay parked for the
    /// next connect.
    async fn replay_pending(&self, topic_key: &str) -> AppResult<usize> {
        let mut replayed = 0;
        loop {
            let pending = {
                let mut replaying = self.replaying.lock();
                let pending = self.storage.pending_notifications(topic_key)?;
                if pending.is_empty() {
                    replaying.remove(topic_key);
                    break;
                }
                pending
            };
            for (seq, message) in pending {
                self.publish_with_retry(message).await?;
                self.storage.remove_pending_notification(topic_key, seq)?;
                replayed += 1;
            }
        }
        if replayed > 0 {
            tracing::info!(topic = %topic_key, count = replayed, "Replayed pending notifications");
        }
        Ok(replayed)
    }

    async fn publish_with_retry(&self, message: BusMessage) -> AppResult<()> {
        retry_with_backoff(PUBLISH_RETRY, "publish notification", || {
            let message = message.clone();
            async move { self.broadcaster.publish(message).await }
        })
        .await
    }

    async fn push_to_courier(&self, courier_id: &str, notification: &Notification) {
        let token = match self.storage.get_courier(courier_id) {
            Ok(Some(courier)) => courier.push_token,
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(courier_id = %courier_id, error = %e, "Courier lookup for push failed");
                None
            }
        };
        let Some(token) = token else {
            return;
        };

        let push = PushMessage::new(token, notification);
        let result = retry_with_backoff(PUSH_RETRY, "push notification", || {
            let push = push.clone();
            async move { self.push.send(&push).await }
        })
        .await;
        if let Err(e) = result {
            tracing::error!(
                courier_id = %courier_id,
                event = notification.kind(),
                error = %e,
                "Push delivery failed"
            );
        }
    }
}

/// Convenience for replaying to a raw topic (e.g. from a transport adapter)
impl From<Topic> for Target {
    fn from(topic: Topic) -> Self {
        match topic {
            Topic::Order(id) => Target::Order(id),
            Topic::Rider(id) => Target::Courier(id),
            Topic::Customer(id) => Target::Customer(id),
            Topic::Vendor(id) => Target::Vendor(id),
            Topic::Admin => Target::Admin,
            Topic::AllRiders => Target::AllCouriers,
        }
    }
}
