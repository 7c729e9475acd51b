use std::sync::Arc;

use shared::message::EtaUpdate;
use shared::order::{Courier, LocationSample, Order};

use crate::core::Config;
use crate::core::tasks::{BackgroundTasks, TaskKind};
use crate::debounce::EventDebouncer;
use crate::dispatch::{AcceptOutcome, DispatchCoordinator, DispatchWindows, RejectOutcome, SubmitOutcome};
use crate::location::LocationTracker;
use crate::message::MessageBus;
use crate::notify::{HttpPushGateway, LogPushGateway, NotificationRouter, PushGateway, Target};
use crate::storage::DispatchStorage;
use crate::timeouts::{JobQueue, TimeoutScheduler, TimeoutWorker, report_dead_letters};
use crate::utils::{AppError, AppResult};

/// 服务器状态 - 持有所有服务的共享引用
///
/// 使用 Arc 实现浅拷贝，clone 成本极低。
///
/// # 服务组件
///
/// | 字段 | 类型 | 说明 |
/// |------|------|------|
/// | config | Config | 配置项 (不可变) |
/// | storage | DispatchStorage | redb 存储 |
/// | message_bus | MessageBus | 实时广播 |
/// | router | Arc<NotificationRouter> | 通知路由 |
/// | coordinator | Arc<DispatchCoordinator> | 派单协调 |
/// | debouncer | Arc<EventDebouncer> | 上下线去抖 |
/// | locations | Arc<LocationTracker> | 位置跟踪 |
///
/// ```ignore
/// let state = ServerState::initialize(&config)?;
/// let mut tasks = state.start_background_tasks();
///
/// state.submit_ready_order("o1").await?;
/// state.accept_offer("o1", "r1").await?;
///
/// tasks.shutdown().await;
/// ```
#[derive(Clone, Debug)]
pub struct ServerState {
    pub config: Config,
    pub storage: DispatchStorage,
    pub message_bus: MessageBus,
    pub router: Arc<NotificationRouter>,
    pub coordinator: Arc<DispatchCoordinator>,
    pub debouncer: Arc<EventDebouncer>,
    pub locations: Arc<LocationTracker>,
    job_queue: JobQueue,
}

impl ServerState {
    /// 初始化服务器状态
    ///
    /// 打开 `WORK_DIR/dispatch.redb`，按依赖顺序构造所有服务。
    pub fn initialize(config: &Config) -> AppResult<Self> {
        config
            .ensure_work_dir()
            .map_err(|e| AppError::internal(format!("Failed to create work dir: {}", e)))?;
        let storage = DispatchStorage::open(config.database_path())?;
        tracing::info!(path = %config.database_path().display(), "Dispatch storage opened");

        let push: Arc<dyn PushGateway> = match &config.push_gateway_url {
            Some(url) => {
                tracing::info!(url = %url, "Using HTTP push gateway");
                Arc::new(HttpPushGateway::new(url.clone()))
            }
            None => {
                tracing::info!("No push gateway configured, pushes are logged only");
                Arc::new(LogPushGateway)
            }
        };
        Ok(Self::with_storage(config.clone(), storage, push))
    }

    /// 用已打开的存储构造 (测试使用内存数据库)
    pub fn with_storage(config: Config, storage: DispatchStorage, push: Arc<dyn PushGateway>) -> Self {
        let message_bus = MessageBus::with_capacity(config.bus_channel_capacity);
        let router = Arc::new(NotificationRouter::new(
            storage.clone(),
            Arc::new(message_bus.clone()),
            push,
        ));

        let job_queue = JobQueue::from_config(storage.clone(), &config);
        let scheduler = TimeoutScheduler::new(job_queue.clone());
        let coordinator = Arc::new(DispatchCoordinator::new(
            storage.clone(),
            scheduler,
            router.clone(),
            DispatchWindows::from_config(&config),
        ));

        let debouncer = Arc::new(EventDebouncer::new(
            storage.clone(),
            config.debounce_window(),
            coordinator.clone(),
        ));
        let locations = Arc::new(LocationTracker::new(
            storage.clone(),
            router.clone(),
            config.average_speed_kmh,
        ));

        Self {
            config,
            storage,
            message_bus,
            router,
            coordinator,
            debouncer,
            locations,
            job_queue,
        }
    }

    /// 启动后台任务 (超时 worker + 死信巡检)
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let mut tasks = BackgroundTasks::new();
        let shutdown = tasks.shutdown_token();

        let worker = TimeoutWorker::new(
            self.job_queue.clone(),
            self.coordinator.clone(),
            self.config.job_poll_interval(),
        );
        tasks.spawn("timeout_worker", TaskKind::Worker, worker.run(shutdown.clone()));
        tasks.spawn(
            "dead_letter_report",
            TaskKind::Periodic,
            report_dead_letters(self.job_queue.clone(), shutdown),
        );

        tasks.log_summary();
        tasks
    }

    /// 停止非任务型组件 (去抖定时器、消息总线)
    pub fn shutdown(&self) {
        self.debouncer.shutdown();
        self.message_bus.shutdown();
    }

    pub fn job_queue(&self) -> &JobQueue {
        &self.job_queue
    }

    // ========== Order hand-off ==========

    /// 外部下单流程写入 / 更新订单
    pub fn upsert_order(&self, order: &Order) -> AppResult<()> {
        if order.id.is_empty() {
            return Err(AppError::validation("order id is empty"));
        }
        if !order.delivery_address.is_valid() {
            return Err(AppError::validation(format!(
                "invalid delivery address for order {}",
                order.id
            )));
        }
        Ok(self.storage.upsert_order(order)?)
    }

    /// 外部平台写入 / 更新骑手
    pub fn upsert_courier(&self, courier: &Courier) -> AppResult<()> {
        if courier.id.is_empty() {
            return Err(AppError::validation("courier id is empty"));
        }
        Ok(self.storage.upsert_courier(courier)?)
    }

    // ========== Dispatch ==========

    pub async fn submit_ready_order(&self, order_id: &str) -> AppResult<SubmitOutcome> {
        self.coordinator.submit_ready_order(order_id).await
    }

    pub async fn accept_offer(&self, order_id: &str, courier_id: &str) -> AppResult<AcceptOutcome> {
        self.coordinator.accept_offer(order_id, courier_id).await
    }

    pub async fn reject_offer(&self, order_id: &str, courier_id: &str) -> AppResult<RejectOutcome> {
        self.coordinator.reject_offer(order_id, courier_id).await
    }

    pub async fn cancel_order(&self, order_id: &str, reason: &str) -> AppResult<Order> {
        self.coordinator.cancel_order(order_id, reason).await
    }

    pub async fn confirm_pickup(&self, order_id: &str, courier_id: &str) -> AppResult<Order> {
        self.coordinator.confirm_pickup(order_id, courier_id).await
    }

    pub async fn start_delivery(&self, order_id: &str, courier_id: &str) -> AppResult<Order> {
        self.coordinator.start_delivery(order_id, courier_id).await
    }

    pub async fn confirm_delivery(&self, order_id: &str, courier_id: &str) -> AppResult<Order> {
        self.coordinator.confirm_delivery(order_id, courier_id).await
    }

    // ========== Courier connectivity ==========

    /// 骑手上线 (经去抖后重查等待订单)
    ///
    /// Returns false when the event was dropped because an earlier online
    /// event for this courier is still in flight.
    pub async fn courier_came_online(&self, courier_id: &str) -> AppResult<bool> {
        self.debouncer.handle_status_change(courier_id, true).await
    }

    /// 骑手下线 (取消待执行的重查，不会被跳过)
    pub async fn courier_went_offline(&self, courier_id: &str) -> AppResult<bool> {
        self.debouncer.handle_status_change(courier_id, false).await
    }

    /// 客户端连接到某个目标主题，首个连接会重放离线通知
    pub async fn client_connected(&self, target: &Target) -> AppResult<usize> {
        self.router.connect(target).await
    }

    /// 客户端断开，返回是否为最后一个连接
    pub fn client_disconnected(&self, target: &Target) -> bool {
        self.router.disconnect(target)
    }

    // ========== Location ==========

    pub async fn ingest_location(
        &self,
        courier_id: &str,
        lat: f64,
        lng: f64,
        timestamp: i64,
        order_id: Option<&str>,
    ) -> AppResult<Option<EtaUpdate>> {
        self.locations
            .ingest(courier_id, lat, lng, timestamp, order_id)
            .await
    }

    pub fn get_courier_location_history(&self, courier_id: &str, limit: usize) -> Vec<LocationSample> {
        self.locations.get_history(courier_id, limit)
    }
}
