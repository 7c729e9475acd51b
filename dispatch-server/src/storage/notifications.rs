//! Offline notification queue
//!
//! Notifications for a personal topic whose subscriber is not connected are
//! parked here, keyed by `(topic, seq)`, and replayed in order on reconnect.
//! Coalescing kinds (ETA updates) keep only the newest row per order.

use redb::{ReadableTable, ReadableTableMetadata, WriteTransaction};
use shared::message::BusMessage;

use super::{
    DispatchStorage, NOTIFICATION_SEQ_KEY, PENDING_NOTIFICATIONS_TABLE, SEQUENCE_TABLE,
    StorageResult,
};

fn next_sequence(txn: &WriteTransaction) -> StorageResult<u64> {
    let mut table = txn.open_table(SEQUENCE_TABLE)?;
    let current = table.get(NOTIFICATION_SEQ_KEY)?.map(|v| v.value()).unwrap_or(0);
    let next = current + 1;
    table.insert(NOTIFICATION_SEQ_KEY, next)?;
    Ok(next)
}

impl DispatchStorage {
    /// Park a notification for `topic_key`, returning its sequence number
    ///
    /// A coalescing notification replaces the parked one of the same kind
    /// for the same order; the new row takes the latest sequence.
    pub fn push_pending_notification(
        &self,
        topic_key: &str,
        message: &BusMessage,
    ) -> StorageResult<u64> {
        let txn = self.begin_write()?;
        let seq = next_sequence(&txn)?;
        {
            let mut table = txn.open_table(PENDING_NOTIFICATIONS_TABLE)?;
            if message.notification.coalesces() {
                let mut superseded = Vec::new();
                for result in table.range((topic_key, 0u64)..=(topic_key, u64::MAX))? {
                    let (key, value) = result?;
                    let parked: BusMessage = serde_json::from_slice(value.value())?;
                    if parked.notification.kind() == message.notification.kind()
                        && parked.notification.order_id() == message.notification.order_id()
                    {
                        superseded.push(key.value().1);
                    }
                }
                for old in superseded {
                    table.remove((topic_key, old))?;
                }
            }
            let value = serde_json::to_vec(message)?;
            table.insert((topic_key, seq), value.as_slice())?;
        }
        txn.commit()?;
        Ok(seq)
    }

    /// Parked notifications for `topic_key`, oldest first
    pub fn pending_notifications(&self, topic_key: &str) -> StorageResult<Vec<(u64, BusMessage)>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(PENDING_NOTIFICATIONS_TABLE)?;

        let mut messages = Vec::new();
        for result in table.range((topic_key, 0u64)..=(topic_key, u64::MAX))? {
            let (key, value) = result?;
            let (_, seq) = key.value();
            messages.push((seq, serde_json::from_slice(value.value())?));
        }
        Ok(messages)
    }

    /// Drop a parked notification once it has been delivered
    pub fn remove_pending_notification(&self, topic_key: &str, seq: u64) -> StorageResult<()> {
        let txn = self.begin_write()?;
        {
            let mut table = txn.open_table(PENDING_NOTIFICATIONS_TABLE)?;
            table.remove((topic_key, seq))?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Total number of parked notifications
    pub fn pending_notification_count(&self) -> StorageResult<u64> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(PENDING_NOTIFICATIONS_TABLE)?;
        Ok(table.len()?)
    }
}
