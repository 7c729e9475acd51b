//! Server Implementation
//!
//! 派单核心的启动和管理

use crate::core::{Config, ServerState};
use crate::utils::AppResult;

/// Dispatch server
pub struct Server {
    config: Config,
    state: Option<ServerState>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: None,
        }
    }

    /// Create server with existing state (for embedding and tests)
    pub fn with_state(config: Config, state: ServerState) -> Self {
        Self {
            config,
            state: Some(state),
        }
    }

    /// 运行直到收到 Ctrl+C
    pub async fn run(&self) -> AppResult<()> {
        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down...");
        };
        self.run_until(shutdown).await
    }

    /// 运行直到 `shutdown` 完成，然后优雅退出
    pub async fn run_until<F>(&self, shutdown: F) -> AppResult<()>
    where
        F: std::future::Future<Output = ()>,
    {
        // Create application state if not provided
        let state = match &self.state {
            Some(s) => s.clone(),
            None => ServerState::initialize(&self.config)?,
        };

        let tasks = state.start_background_tasks();

        let waiting = state.storage.waiting_orders()?;
        tracing::info!(
            waiting_orders = waiting.len(),
            armed_jobs = state.job_queue().jobs()?.len(),
            "🛵 Dispatch server ready"
        );

        shutdown.await;

        state.shutdown();
        tasks.shutdown().await;
        tracing::info!("Dispatch server stopped");
        Ok(())
    }
}
