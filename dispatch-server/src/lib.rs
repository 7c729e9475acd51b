//! Dispatch Server - 外卖配送派单核心
//!
//! # 架构概述
//!
//! 订单备餐完成后，本核心负责把订单派给附近的在线骑手，并驱动后续
//! 的取餐 / 配送流程：
//!
//! - **派单** (`dispatch`): 广播派单、抢单 (CAS)、拒单、转人工
//! - **去抖** (`debounce`): 骑手上下线抖动合并 + 处理锁
//! - **超时** (`timeouts`): 持久化延迟任务队列，指数退避 + 死信
//! - **位置** (`location`): 位置历史和 ETA 计算
//! - **通知** (`notify`): 在线实时广播，离线暂存 + 推送
//! - **存储** (`storage`): 嵌入式 redb
//!
//! # 模块结构
//!
//! ```text
//! dispatch-server/src/
//! ├── core/          # 配置、状态、后台任务
//! ├── dispatch/      # 派单协调
//! ├── debounce/      # 上下线去抖
//! ├── timeouts/      # 超时调度
//! ├── location/      # 位置跟踪
//! ├── notify/        # 通知路由
//! ├── message/       # 实时消息总线
//! ├── storage/       # redb 存储
//! └── utils/         # 错误、日志、重试
//! ```

pub mod core;
pub mod debounce;
pub mod dispatch;
pub mod location;
pub mod message;
pub mod notify;
pub mod storage;
pub mod timeouts;
pub mod utils;

// Re-export 公共类型
pub use core::{Config, Server, ServerState};
pub use dispatch::{AcceptOutcome, DispatchCoordinator, RejectOutcome, SubmitOutcome};
pub use message::{BusMessage, MessageBus};
pub use notify::{NotificationRouter, Target};
pub use storage::DispatchStorage;
pub use utils::{AppError, AppResult};

// Re-export logger functions
pub use utils::logger::{init_logger, init_logger_with_file};

/// 设置运行环境 (dotenv, 配置, 日志目录, 日志)
///
/// 日志级别和目录取自返回的 [`Config`]。
pub fn setup_environment() -> anyhow::Result<Config> {
    // .env is optional
    dotenv::dotenv().ok();

    let config = Config::from_env();
    config.ensure_log_dir().map_err(|e| {
        anyhow::anyhow!("Failed to create log dir {:?}: {}", config.log_dir, e)
    })?;

    init_logger_with_file(Some(&config.log_level), config.log_dir.as_deref());
    Ok(config)
}

pub fn print_banner() {
    println!(
        r#"
    ___  _                 __       __
   / _ \(_)__ ___  ___ _  / /_____ / /
  / // / (_-</ _ \/ _ `/ / __/ __// _ \
 /____/_/___/ .__/\_,_/  \__/\__//_//_/
           /_/
"#
    );
}
