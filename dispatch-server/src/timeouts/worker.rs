//! Timeout Worker - 超时任务轮询与执行
//!
//! ```text
//! ┌─────────┐  claim (lease)   ┌──────────────┐
//! │ JobQueue │ ───────────────▶ │ TimeoutWorker │ ──▶ TimeoutHandler
//! └─────────┘                   └──────┬───────┘
//!      ▲        Ok / stale ──▶ complete │
//!      └─────── transient ──▶ backoff  │
//!               exhausted ──▶ dead letter
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::queue::{JobQueue, RetryDecision};
use super::scheduler::TimeoutHandler;
use crate::storage::{Job, JobPayload};
use crate::utils::AppResult;

/// 单次轮询最多领取的任务数
const CLAIM_BATCH_SIZE: usize = 32;
/// 死信巡检间隔
const DEAD_LETTER_REPORT_INTERVAL: Duration = Duration::from_secs(300);

/// Result of one poll
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub completed: usize,
    pub stale: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
}

impl PollSummary {
    pub fn processed(&self) -> usize {
        self.completed + self.stale + self.rescheduled + self.dead_lettered
    }
}

pub struct TimeoutWorker {
    queue: JobQueue,
    handler: Arc<dyn TimeoutHandler>,
    poll_interval: Duration,
}

impl TimeoutWorker {
    pub fn new(queue: JobQueue, handler: Arc<dyn TimeoutHandler>, poll_interval: Duration) -> Self {
        Self {
            queue,
            handler,
            poll_interval,
        }
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "TimeoutWorker started"
        );

        // Recover dead letters left by a previous run
        match self.queue.requeue_dead_letters() {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "Requeued dead letter timeout jobs"),
            Err(e) => tracing::error!(error = %e, "Failed to requeue dead letter jobs"),
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("TimeoutWorker received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.queue.wakeup().notified() => {}
            }

            match self.poll_once(shared::util::now_millis()).await {
                Ok(summary) if summary.processed() > 0 => {
                    tracing::debug!(?summary, "Timeout jobs processed");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Failed to poll timeout jobs"),
            }
        }

        tracing::info!("TimeoutWorker stopped");
    }

    /// Claim and run every job due at `now`
    pub async fn poll_once(&self, now: i64) -> AppResult<PollSummary> {
        let mut summary = PollSummary::default();
        loop {
            let jobs = self.queue.claim_due(now, CLAIM_BATCH_SIZE)?;
            let batch = jobs.len();
            for job in jobs {
                self.process(&job, now, &mut summary).await?;
            }
            if batch < CLAIM_BATCH_SIZE {
                return Ok(summary);
            }
        }
    }

    async fn process(&self, job: &Job, now: i64, summary: &mut PollSummary) -> AppResult<()> {
        let JobPayload::Timeout { order_id, kind } = &job.payload;

        match self.handler.handle_timeout(order_id, *kind).await {
            Ok(()) => {
                self.queue.complete(&job.id)?;
                summary.completed += 1;
            }
            Err(e) if e.is_stale() => {
                tracing::debug!(
                    order_id = %order_id,
                    kind = %kind,
                    reason = %e,
                    "Stale timeout, dropped"
                );
                self.queue.complete(&job.id)?;
                summary.stale += 1;
            }
            Err(e) if e.is_retryable() => {
                let error = e.to_string();
                match self.queue.retry_later(job, now, &error)? {
                    RetryDecision::Rescheduled { delay } => {
                        tracing::warn!(
                            order_id = %order_id,
                            kind = %kind,
                            attempt = job.attempts,
                            max_attempts = job.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Timeout handler failed, retrying"
                        );
                        summary.rescheduled += 1;
                    }
                    RetryDecision::DeadLettered => {
                        tracing::error!(
                            order_id = %order_id,
                            kind = %kind,
                            attempts = job.attempts,
                            error = %error,
                            "Timeout job exhausted retries, moved to dead letter"
                        );
                        summary.dead_lettered += 1;
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    order_id = %order_id,
                    kind = %kind,
                    error = %e,
                    "Timeout handler failed permanently, moved to dead letter"
                );
                self.queue.bury(job, &e.to_string())?;
                summary.dead_lettered += 1;
            }
        }
        Ok(())
    }
}

/// Periodic dead letter report
pub async fn report_dead_letters(queue: JobQueue, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(DEAD_LETTER_REPORT_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match queue.dead_letters() {
            Ok(dead) if !dead.is_empty() => {
                tracing::warn!(count = dead.len(), "Timeout jobs waiting in dead letter");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Failed to read dead letter jobs"),
        }
    }
}
