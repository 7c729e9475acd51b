//! redb-based storage layer for order dispatch
//!
//! # Tables
//!
//! | Table | Key | Value | Purpose |
//! |-------|-----|-------|---------|
//! | `orders` | `order_id` | `Order` | Order records (status / rider are conditionally mutated) |
//! | `couriers` | `courier_id` | `Courier` | Courier records |
//! | `active_assignments` | `courier_id` | `order_id` | One active order per courier |
//! | `jobs` | `job_id` | `Job` | Durable delayed job queue |
//! | `dead_letter_jobs` | `job_id` | `DeadLetterJob` | Jobs that exhausted their attempts |
//! | `pending_notifications` | `(topic, seq)` | `BusMessage` | Offline notification queue |
//! | `sequence_counter` | name | `u64` | Monotonic counters |
//!
//! # Atomicity
//!
//! redb serializes write transactions. Every conditional update (assignment,
//! status transition, cancellation) reads the current record, checks its
//! precondition and writes inside ONE write transaction, so a concurrent
//! writer always observes the committed result of the other. This is the
//! compare-and-set that guarantees first-accept-wins.

mod jobs;
mod notifications;
mod orders;

pub use jobs::{DeadLetterJob, Job, JobPayload};
pub use orders::{AssignAttempt, StatusUpdate};

use redb::{Database, ReadableDatabase, TableDefinition, WriteTransaction};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Table for orders: key = order_id, value = JSON-serialized Order
pub(crate) const ORDERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("orders");

/// Table for couriers: key = courier_id, value = JSON-serialized Courier
pub(crate) const COURIERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("couriers");

/// Table for active assignments: key = courier_id, value = order_id
pub(crate) const ACTIVE_ASSIGNMENTS_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("active_assignments");

/// Table for delayed jobs: key = job_id, value = JSON-serialized Job
pub(crate) const JOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Table for dead letter jobs: key = job_id, value = JSON-serialized DeadLetterJob
pub(crate) const DEAD_LETTER_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("dead_letter_jobs");

/// Table for offline notifications: key = (topic, sequence), value = JSON-serialized BusMessage
pub(crate) const PENDING_NOTIFICATIONS_TABLE: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("pending_notifications");

/// Table for counters: key = counter name, value = u64
pub(crate) const SEQUENCE_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("sequence_counter");

pub(crate) const NOTIFICATION_SEQ_KEY: &str = "notification_seq";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Courier not found: {0}")]
    CourierNotFound(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Dispatch storage backed by redb
#[derive(Clone)]
pub struct DispatchStorage {
    db: Arc<Database>,
}

impl std::fmt::Debug for DispatchStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchStorage").finish_non_exhaustive()
    }
}

impl DispatchStorage {
    /// Open or create the database at the given path
    ///
    /// Commits are durable as soon as `commit()` returns (redb default
    /// `Durability::Immediate`), so armed timeouts and parked notifications
    /// survive a restart.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Open an in-memory database (for tests and single-run demos)
    pub fn open_in_memory() -> StorageResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> StorageResult<Self> {
        let write_txn = db.begin_write()?;
        {
            // Create all tables if they don't exist
            let _ = write_txn.open_table(ORDERS_TABLE)?;
            let _ = write_txn.open_table(COURIERS_TABLE)?;
            let _ = write_txn.open_table(ACTIVE_ASSIGNMENTS_TABLE)?;
            let _ = write_txn.open_table(JOBS_TABLE)?;
            let _ = write_txn.open_table(DEAD_LETTER_TABLE)?;
            let _ = write_txn.open_table(PENDING_NOTIFICATIONS_TABLE)?;
            let _ = write_txn.open_table(SEQUENCE_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Begin a write transaction
    pub(crate) fn begin_write(&self) -> StorageResult<WriteTransaction> {
        Ok(self.db.begin_write()?)
    }

    /// Begin a read transaction
    pub(crate) fn begin_read(&self) -> StorageResult<redb::ReadTransaction> {
        Ok(self.db.begin_read()?)
    }
}
