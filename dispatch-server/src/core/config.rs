use std::path::PathBuf;
use std::time::Duration;

/// 服务器配置 - 派单核心的所有配置项
///
/// # 环境变量
///
/// 所有配置项都可以通过环境变量覆盖：
///
/// | 环境变量 | 默认值 | 说明 |
/// |----------|--------|------|
/// | WORK_DIR | ./data | 工作目录 (数据库文件所在) |
/// | LOG_LEVEL | info | 日志级别 |
/// | LOG_DIR | - | 滚动日志目录 (可选) |
/// | DEBOUNCE_WINDOW_MS | 3000 | 骑手上下线去抖窗口 |
/// | ASSIGNMENT_TIMEOUT_SECS | 120 | 派单窗口，超时转人工 |
/// | PICKUP_TIMEOUT_SECS | 1800 | 取餐窗口，超时自动取消 |
/// | DELIVERY_TIMEOUT_SECS | 3600 | 配送窗口 (仅记录日志) |
/// | AVERAGE_SPEED_KMH | 30 | ETA 计算用平均速度 |
/// | JOB_POLL_INTERVAL_MS | 500 | 超时任务轮询间隔 |
/// | JOB_MAX_ATTEMPTS | 5 | 任务最多尝试次数，超过进入死信 |
/// | JOB_RETRY_BASE_MS | 2000 | 任务重试退避基数 |
/// | JOB_LEASE_SECS | 30 | 任务领取租约 |
/// | PUSH_GATEWAY_URL | - | 推送网关地址 (可选) |
/// | BUS_CHANNEL_CAPACITY | 1024 | 实时广播通道容量 |
///
/// # 示例
///
/// ```ignore
/// WORK_DIR=/data/dispatch ASSIGNMENT_TIMEOUT_SECS=60 cargo run
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// 工作目录，存储数据库和日志
    pub work_dir: String,
    pub log_level: String,
    pub log_dir: Option<String>,

    // === 派单窗口 ===
    pub debounce_window_ms: u64,
    pub assignment_timeout_secs: u64,
    pub pickup_timeout_secs: u64,
    pub delivery_timeout_secs: u64,

    // === 位置 ===
    pub average_speed_kmh: f64,

    // === 任务队列 ===
    pub job_poll_interval_ms: u64,
    pub job_max_attempts: u32,
    pub job_retry_base_ms: u64,
    pub job_lease_secs: u64,

    // === 通知 ===
    pub push_gateway_url: Option<String>,
    pub bus_channel_capacity: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// 从环境变量加载配置
    ///
    /// 如果环境变量未设置，使用默认值
    pub fn from_env() -> Self {
        Self {
            work_dir: std::env::var("WORK_DIR").unwrap_or_else(|_| "./data".into()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            log_dir: std::env::var("LOG_DIR").ok().filter(|dir| !dir.is_empty()),
            debounce_window_ms: env_or("DEBOUNCE_WINDOW_MS", 3000),
            assignment_timeout_secs: env_or("ASSIGNMENT_TIMEOUT_SECS", 120),
            pickup_timeout_secs: env_or("PICKUP_TIMEOUT_SECS", 1800),
            delivery_timeout_secs: env_or("DELIVERY_TIMEOUT_SECS", 3600),
            average_speed_kmh: env_or("AVERAGE_SPEED_KMH", 30.0),
            job_poll_interval_ms: env_or("JOB_POLL_INTERVAL_MS", 500),
            job_max_attempts: env_or("JOB_MAX_ATTEMPTS", 5),
            job_retry_base_ms: env_or("JOB_RETRY_BASE_MS", 2000),
            job_lease_secs: env_or("JOB_LEASE_SECS", 30),
            push_gateway_url: std::env::var("PUSH_GATEWAY_URL")
                .ok()
                .filter(|url| !url.is_empty()),
            bus_channel_capacity: env_or("BUS_CHANNEL_CAPACITY", 1024),
        }
    }

    /// 测试用配置：短窗口，不读取环境变量
    pub fn for_tests(work_dir: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            log_level: "debug".into(),
            log_dir: None,
            debounce_window_ms: 3000,
            assignment_timeout_secs: 120,
            pickup_timeout_secs: 1800,
            delivery_timeout_secs: 3600,
            average_speed_kmh: 30.0,
            job_poll_interval_ms: 100,
            job_max_attempts: 3,
            job_retry_base_ms: 100,
            job_lease_secs: 30,
            push_gateway_url: None,
            bus_channel_capacity: 1024,
        }
    }

    /// 数据库文件路径
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.work_dir).join("dispatch.redb")
    }

    /// 确保工作目录存在
    pub fn ensure_work_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.work_dir)
    }

    /// 确保日志目录存在 (未配置时什么都不做)
    pub fn ensure_log_dir(&self) -> std::io::Result<()> {
        match &self.log_dir {
            Some(dir) => std::fs::create_dir_all(dir),
            None => Ok(()),
        }
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn timeout_delay(&self, kind: shared::TimeoutKind) -> Duration {
        let secs = match kind {
            shared::TimeoutKind::RiderAssignment => self.assignment_timeout_secs,
            shared::TimeoutKind::Pickup => self.pickup_timeout_secs,
            shared::TimeoutKind::Delivery => self.delivery_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }

    pub fn job_retry_base(&self) -> Duration {
        Duration::from_millis(self.job_retry_base_ms)
    }

    pub fn job_lease(&self) -> Duration {
        Duration::from_secs(self.job_lease_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
