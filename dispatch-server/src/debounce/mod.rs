//! 事件去抖模块
//!
//! - [`EventDebouncer`] - 骑手上下线去抖，延迟触发等待订单重查
//! - [`ProcessingLocks`] - 短期处理锁

pub mod debouncer;
pub mod locks;

pub use debouncer::{EventDebouncer, WaitingOrdersRecheck};
pub use locks::{LockKey, ProcessingGuard, ProcessingLocks};
