//! Job queue on top of [`DispatchStorage`]
//!
//! - delay: `run_at = now + delay`
//! - at-least-once: claimed jobs are leased, not removed
//! - retry: `base * 2^(attempts-1)`, capped, then dead letter
//! - cancellation: remove by predicate (order + kind)

use std::sync::Arc;
use std::time::Duration;

use shared::order::TimeoutKind;
use tokio::sync::Notify;

use crate::core::Config;
use crate::storage::{DeadLetterJob, DispatchStorage, Job, JobPayload};
use crate::utils::AppResult;
use crate::utils::retry::backoff_delay;

/// Retry delay cap
const RETRY_MAX_DELAY: Duration = Duration::from_secs(300);

/// What happened to a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Rescheduled { delay: Duration },
    DeadLettered,
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    storage: DispatchStorage,
    max_attempts: u32,
    retry_base: Duration,
    lease: Duration,
    wakeup: Arc<Notify>,
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl JobQueue {
    pub fn new(storage: DispatchStorage, max_attempts: u32, retry_base: Duration, lease: Duration) -> Self {
        Self {
            storage,
            max_attempts: max_attempts.max(1),
            retry_base,
            lease,
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn from_config(storage: DispatchStorage, config: &Config) -> Self {
        Self::new(
            storage,
            config.job_max_attempts,
            config.job_retry_base(),
            config.job_lease(),
        )
    }

    /// Schedule a timeout job, replacing any for the same order and kind
    pub fn enqueue_timeout(&self, order_id: &str, kind: TimeoutKind, delay: Duration) -> AppResult<Job> {
        let run_at = shared::util::now_millis().saturating_add(millis(delay));
        let job = Job::new(JobPayload::timeout(order_id, kind), run_at, self.max_attempts);
        let replaced = self.storage.replace_timeout_job(&job)?;
        if replaced > 0 {
            tracing::debug!(order_id = %order_id, kind = %kind, "Replaced armed timeout");
        }
        self.wakeup.notify_one();
        Ok(job)
    }

    /// Remove timeout jobs for an order (one kind or all)
    pub fn remove_timeouts(&self, order_id: &str, kind: Option<TimeoutKind>) -> AppResult<usize> {
        Ok(self.storage.remove_timeout_jobs(order_id, kind)?)
    }

    /// Claim due jobs at `now` (Unix millis)
    pub fn claim_due(&self, now: i64, limit: usize) -> AppResult<Vec<Job>> {
        Ok(self.storage.claim_due_jobs(now, millis(self.lease), limit)?)
    }

    pub fn complete(&self, job_id: &str) -> AppResult<()> {
        Ok(self.storage.complete_job(job_id)?)
    }

    /// Back off a job after a transient failure, or dead-letter it once its
    /// attempts are used up
    pub fn retry_later(&self, job: &Job, now: i64, error: &str) -> AppResult<RetryDecision> {
        if job.attempts_exhausted() {
            self.storage.dead_letter_job(&job.id, error)?;
            return Ok(RetryDecision::DeadLettered);
        }

        let delay = backoff_delay(
            self.retry_base,
            job.attempts.saturating_sub(1),
            RETRY_MAX_DELAY,
        );
        self.storage
            .reschedule_job(&job.id, now.saturating_add(millis(delay)), error)?;
        Ok(RetryDecision::Rescheduled { delay })
    }

    /// Dead-letter a job without retrying
    pub fn bury(&self, job: &Job, error: &str) -> AppResult<()> {
        Ok(self.storage.dead_letter_job(&job.id, error)?)
    }

    pub fn dead_letters(&self) -> AppResult<Vec<DeadLetterJob>> {
        Ok(self.storage.dead_letters()?)
    }

    /// Move dead letters back into the queue with a fresh attempt budget
    pub fn requeue_dead_letters(&self) -> AppResult<usize> {
        let count = self
            .storage
            .requeue_dead_letters(shared::util::now_millis())?;
        if count > 0 {
            self.wakeup.notify_one();
        }
        Ok(count)
    }

    pub fn jobs(&self) -> AppResult<Vec<Job>> {
        Ok(self.storage.jobs()?)
    }

    /// Wakes the worker when a job is queued
    pub fn wakeup(&self) -> &Notify {
        &self.wakeup
    }
}
