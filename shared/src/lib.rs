//! Shared types for the courier dispatch workspace
//!
//! Records, wire messages and small utilities used by `dispatch-server`
//! and by clients that subscribe to its real-time topics.

pub mod message;
pub mod order;
pub mod util;

// Re-exports
pub use serde::{Deserialize, Serialize};

// Message re-exports (for convenient access)
pub use message::{BusMessage, Notification, Topic};
pub use order::{Courier, GeoPoint, LocationSample, Order, OrderStatus, TimeoutKind};
