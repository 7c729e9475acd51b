//! 超时调度 - 订单生命周期窗口的定时任务

use std::time::Duration;

use async_trait::async_trait;
use shared::order::TimeoutKind;

use super::queue::JobQueue;
use crate::utils::AppResult;

/// Runs when an armed timeout fires
///
/// Jobs are delivered at least once and may race with a disarm, so the
/// handler must re-validate the order before acting. `NotFound` and
/// `InvalidStateTransition` mean the timeout is stale and are not retried.
#[async_trait]
pub trait TimeoutHandler: Send + Sync {
    async fn handle_timeout(&self, order_id: &str, kind: TimeoutKind) -> AppResult<()>;
}

/// An armed timeout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutHandle {
    pub job_id: String,
    pub order_id: String,
    pub kind: TimeoutKind,
    /// Due time (Unix millis)
    pub run_at: i64,
}

#[derive(Debug, Clone)]
pub struct TimeoutScheduler {
    queue: JobQueue,
}

impl TimeoutScheduler {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Arm `kind` for `order_id`, replacing any armed timeout of that kind
    pub fn arm(&self, order_id: &str, kind: TimeoutKind, delay: Duration) -> AppResult<TimeoutHandle> {
        let job = self.queue.enqueue_timeout(order_id, kind, delay)?;
        tracing::debug!(
            order_id = %order_id,
            kind = %kind,
            delay_secs = delay.as_secs(),
            "Timeout armed"
        );
        Ok(TimeoutHandle {
            job_id: job.id,
            order_id: order_id.to_string(),
            kind,
            run_at: job.run_at,
        })
    }

    /// Remove the armed timeout of `kind`; returns whether one was armed
    pub fn disarm(&self, order_id: &str, kind: TimeoutKind) -> AppResult<bool> {
        let removed = self.queue.remove_timeouts(order_id, Some(kind))?;
        if removed > 0 {
            tracing::debug!(order_id = %order_id, kind = %kind, "Timeout disarmed");
        }
        Ok(removed > 0)
    }

    /// Remove every armed timeout for the order
    pub fn disarm_all(&self, order_id: &str) -> AppResult<usize> {
        let removed = self.queue.remove_timeouts(order_id, None)?;
        if removed > 0 {
            tracing::debug!(order_id = %order_id, removed, "All timeouts disarmed");
        }
        Ok(removed)
    }

    /// Armed timeouts for an order
    pub fn armed(&self, order_id: &str) -> AppResult<Vec<TimeoutKind>> {
        let mut kinds: Vec<TimeoutKind> = self
            .queue
            .jobs()?
            .into_iter()
            .filter(|job| job.payload.matches_timeout(order_id, None))
            .map(|job| match job.payload {
                crate::storage::JobPayload::Timeout { kind, .. } => kind,
            })
            .collect();
        kinds.sort_by_key(|k| TimeoutKind::ALL.iter().position(|x| x == k));
        Ok(kinds)
    }
}
