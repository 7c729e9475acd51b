//! Real-time transport for dispatch notifications
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           MessageBus                     │
//! │  ┌───────────────────────────────────┐  │
//! │  │  broadcast::Sender<BusMessage>    │  │
//! │  └───────────────────────────────────┘  │
//! └────────────────┬────────────────────────┘
//!                  │
//!         ┌────────┴────────┐
//!         │ Broadcaster     │  ◄── 可插拔
//!         └────────┬────────┘
//!                  │
//!     ┌────────────┼────────────┐
//!     ▼            ▼            ▼
//! order:{id}   rider:{id}    riders / admin
//! ```

use async_trait::async_trait;

pub mod bus;

pub use bus::{MessageBus, TopicSubscription};
pub use shared::message::{BusMessage, Notification, Topic};

use crate::utils::AppResult;

// ========== Broadcaster Trait ==========

/// Topic publisher used by the notification router
///
/// Errors must be `ExternalUnavailable` for transient transport failures so
/// the router can retry them.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn publish(&self, message: BusMessage) -> AppResult<()>;
}
