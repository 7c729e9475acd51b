//! Durable delayed job queue
//!
//! Jobs are claimed with a lease: a claimed job stays in the table with its
//! `run_at` pushed to the end of the lease, so a worker that dies mid-job
//! leaves it to be claimed again once the lease runs out (at-least-once).

use redb::{ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use shared::order::TimeoutKind;

use super::{DEAD_LETTER_TABLE, DispatchStorage, JOBS_TABLE, StorageResult};

/// 任务内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// 订单超时检查
    Timeout { order_id: String, kind: TimeoutKind },
}

impl JobPayload {
    pub fn timeout(order_id: impl Into<String>, kind: TimeoutKind) -> Self {
        Self::Timeout {
            order_id: order_id.into(),
            kind,
        }
    }

    /// Timeout for `order_id`, optionally restricted to one kind
    pub fn matches_timeout(&self, order_id: &str, kind: Option<TimeoutKind>) -> bool {
        match self {
            JobPayload::Timeout {
                order_id: id,
                kind: k,
            } => id == order_id && kind.is_none_or(|kind| kind == *k),
        }
    }
}

/// Queued job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub payload: JobPayload,
    /// Due time (Unix millis); moved forward while leased or backing off
    pub run_at: i64,
    /// Attempts started so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
}

impl Job {
    pub fn new(payload: JobPayload, run_at: i64, max_attempts: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            run_at,
            attempts: 0,
            max_attempts,
            last_error: None,
            created_at: shared::util::now_millis(),
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Job that exhausted its attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub job: Job,
    pub failed_at: i64,
    pub last_error: String,
}

fn load_job(txn: &WriteTransaction, job_id: &str) -> StorageResult<Option<Job>> {
    let table = txn.open_table(JOBS_TABLE)?;
    let job = match table.get(job_id)? {
        Some(value) => Some(serde_json::from_slice(value.value())?),
        None => None,
    };
    Ok(job)
}

fn save_job(txn: &WriteTransaction, job: &Job) -> StorageResult<()> {
    let mut table = txn.open_table(JOBS_TABLE)?;
    let value = serde_json::to_vec(job)?;
    table.insert(job.id.as_str(), value.as_slice())?;
    Ok(())
}

fn remove_timeout_jobs_txn(
    txn: &WriteTransaction,
    order_id: &str,
    kind: Option<TimeoutKind>,
) -> StorageResult<usize> {
    let mut table = txn.open_table(JOBS_TABLE)?;

    let mut matching = Vec::new();
    for result in table.iter()? {
        let (key, value) = result?;
        let job: Job = serde_json::from_slice(value.value())?;
        if job.payload.matches_timeout(order_id, kind) {
            matching.push(key.value().to_string());
        }
    }

    for job_id in &matching {
        table.remove(job_id.as_str())?;
    }
    Ok(matching.len())
}

impl DispatchStorage {
    /// Arm a timeout job, replacing any job with the same order and kind
    ///
    /// Returns the number of jobs replaced.
    pub fn replace_timeout_job(&self, job: &Job) -> StorageResult<usize> {
        let JobPayload::Timeout { order_id, kind } = &job.payload;

        let txn = self.begin_write()?;
        let replaced = remove_timeout_jobs_txn(&txn, order_id, Some(*kind))?;
        save_job(&txn, job)?;
        txn.commit()?;
        Ok(replaced)
    }

    /// Remove pending timeout jobs for an order (one kind or all kinds)
    pub fn remove_timeout_jobs(
        &self,
        order_id: &str,
        kind: Option<TimeoutKind>,
    ) -> StorageResult<usize> {
        let txn = self.begin_write()?;
        let removed = remove_timeout_jobs_txn(&txn, order_id, kind)?;
        txn.commit()?;
        Ok(removed)
    }

    /// Claim up to `limit` due jobs, earliest first
    ///
    /// Each claimed job has its attempt counter bumped and its `run_at`
    /// moved to `now + lease_ms`.
    pub fn claim_due_jobs(&self, now: i64, lease_ms: i64, limit: usize) -> StorageResult<Vec<Job>> {
        let txn = self.begin_write()?;
        let mut claimed = Vec::new();
        {
            let mut table = txn.open_table(JOBS_TABLE)?;

            let mut due = Vec::new();
            for result in table.iter()? {
                let (_key, value) = result?;
                let job: Job = serde_json::from_slice(value.value())?;
                if job.run_at <= now {
                    due.push(job);
                }
            }
            due.sort_by_key(|j| j.run_at);
            due.truncate(limit);

            for mut job in due {
                job.attempts += 1;
                job.run_at = now + lease_ms;
                let value = serde_json::to_vec(&job)?;
                table.insert(job.id.as_str(), value.as_slice())?;
                claimed.push(job);
            }
        }
        txn.commit()?;
        Ok(claimed)
    }

    /// Remove a finished job
    pub fn complete_job(&self, job_id: &str) -> StorageResult<()> {
        let txn = self.begin_write()?;
        {
            let mut table = txn.open_table(JOBS_TABLE)?;
            table.remove(job_id)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Put a failed job back with a new due time
    ///
    /// Returns false if the job was removed in the meantime (disarmed).
    pub fn reschedule_job(&self, job_id: &str, run_at: i64, error: &str) -> StorageResult<bool> {
        let txn = self.begin_write()?;
        let Some(mut job) = load_job(&txn, job_id)? else {
            return Ok(false);
        };
        job.run_at = run_at;
        job.last_error = Some(error.to_string());
        save_job(&txn, &job)?;
        txn.commit()?;
        Ok(true)
    }

    /// Move a job to the dead letter table
    pub fn dead_letter_job(&self, job_id: &str, error: &str) -> StorageResult<()> {
        let txn = self.begin_write()?;
        if let Some(mut job) = load_job(&txn, job_id)? {
            job.last_error = Some(error.to_string());
            let entry = DeadLetterJob {
                job,
                failed_at: shared::util::now_millis(),
                last_error: error.to_string(),
            };
            {
                let mut dead_letter_table = txn.open_table(DEAD_LETTER_TABLE)?;
                let value = serde_json::to_vec(&entry)?;
                dead_letter_table.insert(job_id, value.as_slice())?;

                let mut jobs_table = txn.open_table(JOBS_TABLE)?;
                jobs_table.remove(job_id)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Get all dead letter entries
    pub fn dead_letters(&self) -> StorageResult<Vec<DeadLetterJob>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(DEAD_LETTER_TABLE)?;

        let mut entries = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            entries.push(serde_json::from_slice(value.value())?);
        }
        Ok(entries)
    }

    /// Move all dead letter entries back to the queue, due at `now`, with a
    /// fresh attempt budget
    pub fn requeue_dead_letters(&self, now: i64) -> StorageResult<usize> {
        let txn = self.begin_write()?;
        let count;
        {
            let mut dead_letter_table = txn.open_table(DEAD_LETTER_TABLE)?;
            let mut jobs_table = txn.open_table(JOBS_TABLE)?;

            let mut entries: Vec<DeadLetterJob> = Vec::new();
            for result in dead_letter_table.iter()? {
                let (_key, value) = result?;
                entries.push(serde_json::from_slice(value.value())?);
            }
            count = entries.len();

            for entry in entries {
                let mut job = entry.job;
                job.attempts = 0;
                job.run_at = now;
                let value = serde_json::to_vec(&job)?;
                jobs_table.insert(job.id.as_str(), value.as_slice())?;
                dead_letter_table.remove(job.id.as_str())?;
            }
        }
        txn.commit()?;
        Ok(count)
    }

    /// All queued jobs (claimed ones included)
    pub fn jobs(&self) -> StorageResult<Vec<Job>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(JOBS_TABLE)?;

        let mut jobs = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            jobs.push(serde_json::from_slice(value.value())?);
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_job(order_id: &str, kind: TimeoutKind, run_at: i64) -> Job {
        Job::new(JobPayload::timeout(order_id, kind), run_at, 3)
    }

    #[test]
    fn test_replace_keeps_one_job_per_order_and_kind() {
        let storage = DispatchStorage::open_in_memory().unwrap();

        let first = timeout_job("o1", TimeoutKind::RiderAssignment, 1_000);
        assert_eq!(storage.replace_timeout_job(&first).unwrap(), 0);
        let pickup = timeout_job("o1", TimeoutKind::Pickup, 1_000);
        assert_eq!(storage.replace_timeout_job(&pickup).unwrap(), 0);

        let second = timeout_job("o1", TimeoutKind::RiderAssignment, 2_000);
        assert_eq!(storage.replace_timeout_job(&second).unwrap(), 1);

        let jobs = storage.jobs().unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().any(|j| j.id == second.id));
        assert!(!jobs.iter().any(|j| j.id == first.id));
    }

    #[test]
    fn test_remove_timeout_jobs_by_kind_and_all() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        for kind in TimeoutKind::ALL {
            storage
                .replace_timeout_job(&timeout_job("o1", kind, 1_000))
                .unwrap();
        }
        storage
            .replace_timeout_job(&timeout_job("o2", TimeoutKind::Pickup, 1_000))
            .unwrap();

        assert_eq!(
            storage
                .remove_timeout_jobs("o1", Some(TimeoutKind::Pickup))
                .unwrap(),
            1
        );
        assert_eq!(storage.remove_timeout_jobs("o1", None).unwrap(), 2);
        assert_eq!(storage.remove_timeout_jobs("o1", None).unwrap(), 0);
        assert_eq!(storage.jobs().unwrap().len(), 1);
    }

    #[test]
    fn test_claim_leases_due_jobs() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        storage
            .replace_timeout_job(&timeout_job("late", TimeoutKind::Pickup, 5_000))
            .unwrap();
        storage
            .replace_timeout_job(&timeout_job("due", TimeoutKind::Pickup, 900))
            .unwrap();

        let claimed = storage.claim_due_jobs(1_000, 30_000, 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].run_at, 31_000);

        // Leased: not claimable again until the lease expires
        assert!(storage.claim_due_jobs(2_000, 30_000, 10).unwrap().is_empty());
        let reclaimed = storage.claim_due_jobs(31_000, 30_000, 10).unwrap();
        assert_eq!(reclaimed.len(), 2);
        let again = reclaimed.iter().find(|j| j.id == claimed[0].id).unwrap();
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn test_dead_letter_and_requeue() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        let job = timeout_job("o1", TimeoutKind::RiderAssignment, 0);
        storage.replace_timeout_job(&job).unwrap();
        storage.claim_due_jobs(10, 1_000, 10).unwrap();

        storage.dead_letter_job(&job.id, "store offline").unwrap();
        assert!(storage.jobs().unwrap().is_empty());

        let dead = storage.dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error, "store offline");
        assert_eq!(dead[0].job.attempts, 1);

        assert_eq!(storage.requeue_dead_letters(50).unwrap(), 1);
        assert!(storage.dead_letters().unwrap().is_empty());
        let jobs = storage.jobs().unwrap();
        assert_eq!(jobs[0].attempts, 0);
        assert_eq!(jobs[0].run_at, 50);
    }

    #[test]
    fn test_reschedule_after_disarm_is_noop() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        let job = timeout_job("o1", TimeoutKind::Pickup, 0);
        storage.replace_timeout_job(&job).unwrap();
        storage.remove_timeout_jobs("o1", None).unwrap();

        assert!(!storage.reschedule_job(&job.id, 100, "boom").unwrap());
        assert!(storage.jobs().unwrap().is_empty());
    }
}
