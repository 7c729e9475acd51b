//! Order and courier records, plus the conditional updates that guard them

use redb::{ReadableTable, WriteTransaction};
use shared::order::{Courier, Order, OrderStatus};

use super::{
    ACTIVE_ASSIGNMENTS_TABLE, COURIERS_TABLE, DispatchStorage, ORDERS_TABLE, StorageError,
    StorageResult,
};

/// Result of the first-accept-wins compare-and-set
#[derive(Debug, Clone, PartialEq)]
pub enum AssignAttempt {
    /// This courier claimed the order
    Assigned(Order),
    /// Someone else already claimed it, or it moved past READY_FOR_PICKUP
    AlreadyTaken {
        status: OrderStatus,
        rider_id: Option<String>,
    },
    /// The order is DELIVERED or CANCELLED
    Terminal(OrderStatus),
    /// The courier already holds another active order
    CourierBusy { active_order_id: String },
}

/// Result of a conditional status update
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// Precondition held, the new record is returned
    Applied(Order),
    /// Precondition failed; the current record is returned untouched
    Mismatch(Order),
}

// ========== Transaction helpers ==========

fn load_order(txn: &WriteTransaction, order_id: &str) -> StorageResult<Order> {
    let table = txn.open_table(ORDERS_TABLE)?;
    let order = match table.get(order_id)? {
        Some(value) => serde_json::from_slice(value.value())?,
        None => return Err(StorageError::OrderNotFound(order_id.to_string())),
    };
    Ok(order)
}

fn save_order(txn: &WriteTransaction, order: &Order) -> StorageResult<()> {
    let mut table = txn.open_table(ORDERS_TABLE)?;
    let value = serde_json::to_vec(order)?;
    table.insert(order.id.as_str(), value.as_slice())?;
    Ok(())
}

fn load_courier(txn: &WriteTransaction, courier_id: &str) -> StorageResult<Courier> {
    let table = txn.open_table(COURIERS_TABLE)?;
    let courier = match table.get(courier_id)? {
        Some(value) => serde_json::from_slice(value.value())?,
        None => return Err(StorageError::CourierNotFound(courier_id.to_string())),
    };
    Ok(courier)
}

fn save_courier(txn: &WriteTransaction, courier: &Courier) -> StorageResult<()> {
    let mut table = txn.open_table(COURIERS_TABLE)?;
    let value = serde_json::to_vec(courier)?;
    table.insert(courier.id.as_str(), value.as_slice())?;
    Ok(())
}

/// Free the courier holding `order_id` (index entry removed, available again)
fn release_courier(txn: &WriteTransaction, courier_id: &str, order_id: &str) -> StorageResult<()> {
    {
        let mut index = txn.open_table(ACTIVE_ASSIGNMENTS_TABLE)?;
        let holds_this_order = match index.get(courier_id)? {
            Some(value) => value.value() == order_id,
            None => false,
        };
        if holds_this_order {
            index.remove(courier_id)?;
        }
    }

    match load_courier(txn, courier_id) {
        Ok(mut courier) => {
            courier.is_available = true;
            save_courier(txn, &courier)
        }
        // A courier deleted by the outer platform has nothing to release
        Err(StorageError::CourierNotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

impl DispatchStorage {
    // ========== Orders ==========

    /// Insert or replace an order record (hand-off from the order-placement flow)
    ///
    /// Keeps the active-assignment index in step with the record.
    pub fn upsert_order(&self, order: &Order) -> StorageResult<()> {
        let txn = self.begin_write()?;
        save_order(&txn, order)?;
        if let Some(rider_id) = &order.rider_id
            && !order.status.is_terminal()
        {
            let mut index = txn.open_table(ACTIVE_ASSIGNMENTS_TABLE)?;
            index.insert(rider_id.as_str(), order.id.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Get an order by ID
    pub fn get_order(&self, order_id: &str) -> StorageResult<Option<Order>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(ORDERS_TABLE)?;

        match table.get(order_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Get an order by ID, failing with `OrderNotFound`
    pub fn require_order(&self, order_id: &str) -> StorageResult<Order> {
        self.get_order(order_id)?
            .ok_or_else(|| StorageError::OrderNotFound(order_id.to_string()))
    }

    /// Orders that are READY_FOR_PICKUP, unassigned and not escalated,
    /// oldest first
    pub fn waiting_orders(&self) -> StorageResult<Vec<Order>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(ORDERS_TABLE)?;

        let mut orders = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            let order: Order = serde_json::from_slice(value.value())?;
            if order.is_waiting_for_rider() {
                orders.push(order);
            }
        }

        orders.sort_by_key(|o| o.ready_at.unwrap_or(o.created_at));
        Ok(orders)
    }

    /// First-accept-wins: claim `order_id` for `courier_id`
    ///
    /// Succeeds only if the order is still READY_FOR_PICKUP, `rider_id` is
    /// still empty and the courier holds no other active order. On success
    /// the order becomes ASSIGNED, the courier becomes unavailable and the
    /// assignment index is written, all in one transaction.
    pub fn try_assign(&self, order_id: &str, courier_id: &str) -> StorageResult<AssignAttempt> {
        let txn = self.begin_write()?;

        let mut order = load_order(&txn, order_id)?;
        let mut courier = load_courier(&txn, courier_id)?;

        if order.status.is_terminal() {
            return Ok(AssignAttempt::Terminal(order.status));
        }
        if order.status != OrderStatus::ReadyForPickup || order.rider_id.is_some() {
            return Ok(AssignAttempt::AlreadyTaken {
                status: order.status,
                rider_id: order.rider_id,
            });
        }

        {
            let mut index = txn.open_table(ACTIVE_ASSIGNMENTS_TABLE)?;
            let active = index.get(courier_id)?.map(|v| v.value().to_string());
            if let Some(active_order_id) = active {
                return Ok(AssignAttempt::CourierBusy { active_order_id });
            }
            index.insert(courier_id, order_id)?;
        }

        let now = shared::util::now_millis();
        order.status = OrderStatus::Assigned;
        order.rider_id = Some(courier_id.to_string());
        order.escalated_at = None;
        order.stamp(OrderStatus::Assigned, now);
        save_order(&txn, &order)?;

        courier.is_available = false;
        save_courier(&txn, &courier)?;

        txn.commit()?;
        Ok(AssignAttempt::Assigned(order))
    }

    /// Move an order `from -> to` if it is still in `from` and held by
    /// `courier_id`. Reaching DELIVERED releases the courier.
    pub fn advance_status(
        &self,
        order_id: &str,
        courier_id: &str,
        from: OrderStatus,
        to: OrderStatus,
    ) -> StorageResult<StatusUpdate> {
        let txn = self.begin_write()?;
        let mut order = load_order(&txn, order_id)?;

        if order.status != from
            || !from.can_transition_to(to)
            || order.rider_id.as_deref() != Some(courier_id)
        {
            return Ok(StatusUpdate::Mismatch(order));
        }

        order.status = to;
        order.stamp(to, shared::util::now_millis());
        save_order(&txn, &order)?;

        if to.is_terminal() {
            release_courier(&txn, courier_id, order_id)?;
        }

        txn.commit()?;
        Ok(StatusUpdate::Applied(order))
    }

    /// Cancel an order from any non-terminal status
    ///
    /// With `only_from`, the order must currently be in that status (used by
    /// timeout handlers to re-validate their precondition). The assigned
    /// courier, if any, is released.
    pub fn cancel_order(
        &self,
        order_id: &str,
        reason: &str,
        only_from: Option<OrderStatus>,
    ) -> StorageResult<StatusUpdate> {
        let txn = self.begin_write()?;
        let mut order = load_order(&txn, order_id)?;

        let precondition = match only_from {
            Some(expected) => order.status == expected,
            None => true,
        };
        if order.status.is_terminal() || !precondition {
            return Ok(StatusUpdate::Mismatch(order));
        }

        order.status = OrderStatus::Cancelled;
        order.cancellation_reason = Some(reason.to_string());
        order.stamp(OrderStatus::Cancelled, shared::util::now_millis());
        save_order(&txn, &order)?;

        if let Some(rider_id) = order.rider_id.clone() {
            release_courier(&txn, &rider_id, order_id)?;
        }

        txn.commit()?;
        Ok(StatusUpdate::Applied(order))
    }

    /// Stamp `escalated_at` if the order is still ready and unassigned
    pub fn mark_escalated(&self, order_id: &str) -> StorageResult<StatusUpdate> {
        let txn = self.begin_write()?;
        let mut order = load_order(&txn, order_id)?;

        if order.status != OrderStatus::ReadyForPickup || order.rider_id.is_some() {
            return Ok(StatusUpdate::Mismatch(order));
        }

        order.escalated_at = Some(shared::util::now_millis());
        save_order(&txn, &order)?;
        txn.commit()?;
        Ok(StatusUpdate::Applied(order))
    }

    /// Clear `escalated_at` so a resubmitted order is dispatched again
    pub fn clear_escalation(&self, order_id: &str) -> StorageResult<Order> {
        let txn = self.begin_write()?;
        let mut order = load_order(&txn, order_id)?;
        if order.escalated_at.take().is_some() {
            save_order(&txn, &order)?;
            txn.commit()?;
        }
        Ok(order)
    }

    // ========== Couriers ==========

    /// Insert or replace a courier record
    pub fn upsert_courier(&self, courier: &Courier) -> StorageResult<()> {
        let txn = self.begin_write()?;
        save_courier(&txn, courier)?;
        txn.commit()?;
        Ok(())
    }

    /// Get a courier by ID
    pub fn get_courier(&self, courier_id: &str) -> StorageResult<Option<Courier>> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(COURIERS_TABLE)?;

        match table.get(courier_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Persist the courier's online flag
    pub fn set_courier_online(&self, courier_id: &str, is_online: bool) -> StorageResult<Courier> {
        let txn = self.begin_write()?;
        let mut courier = load_courier(&txn, courier_id)?;
        if courier.is_online != is_online {
            courier.is_online = is_online;
            save_courier(&txn, &courier)?;
            txn.commit()?;
        }
        Ok(courier)
    }

    /// Write the courier's current position
    pub fn update_courier_position(
        &self,
        courier_id: &str,
        lat: f64,
        lng: f64,
        timestamp: i64,
    ) -> StorageResult<()> {
        let txn = self.begin_write()?;
        let mut courier = load_courier(&txn, courier_id)?;
        courier.current_lat = Some(lat);
        courier.current_lng = Some(lng);
        courier.location_updated_at = Some(timestamp);
        save_courier(&txn, &courier)?;
        txn.commit()?;
        Ok(())
    }

    /// Couriers that are online, available and hold no active order
    pub fn available_couriers(&self) -> StorageResult<Vec<Courier>> {
        let read_txn = self.begin_read()?;
        let couriers = read_txn.open_table(COURIERS_TABLE)?;
        let index = read_txn.open_table(ACTIVE_ASSIGNMENTS_TABLE)?;

        let mut result = Vec::new();
        for entry in couriers.iter()? {
            let (_key, value) = entry?;
            let courier: Courier = serde_json::from_slice(value.value())?;
            if courier.can_take_orders() && index.get(courier.id.as_str())?.is_none() {
                result.push(courier);
            }
        }
        Ok(result)
    }

    /// The order a courier is currently holding, if any
    pub fn active_order_of(&self, courier_id: &str) -> StorageResult<Option<String>> {
        let read_txn = self.begin_read()?;
        let index = read_txn.open_table(ACTIVE_ASSIGNMENTS_TABLE)?;
        Ok(index.get(courier_id)?.map(|v| v.value().to_string()))
    }
}
