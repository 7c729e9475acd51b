//! 派单协调器
//!
//! ```text
//! submit_ready_order ──▶ OfferBook ──▶ OfferCreated ──▶ couriers
//!         │                                   │
//!         └─▶ arm(rider_assignment)           ▼
//!                                  accept_offer / reject_offer
//!                                             │
//!                     storage CAS (first accept wins)
//!                        │                 │
//!                   Assigned            RaceLost
//!     disarm + withdraw + arm(pickup)
//! ```
//!
//! Exclusivity comes only from the storage compare-and-set in
//! [`DispatchStorage::try_assign`]; the offer book is per-process state used
//! to decide who gets notified.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shared::message::{Notification, WithdrawReason};
use shared::order::{Order, OrderStatus, TimeoutKind};

use super::offers::{OfferBook, Rejection};
use crate::core::Config;
use crate::debounce::WaitingOrdersRecheck;
use crate::notify::{NotificationRouter, Target};
use crate::storage::{AssignAttempt, DispatchStorage, StatusUpdate};
use crate::timeouts::{TimeoutHandler, TimeoutScheduler};
use crate::utils::{AppError, AppResult};

const PICKUP_TIMEOUT_REASON: &str = "pickup window expired";
const ASSIGNMENT_TIMEOUT_REASON: &str = "no courier accepted within the assignment window";
const ALL_REJECTED_REASON: &str = "all candidate couriers rejected the offer";

/// Result of `submit_ready_order`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Offer broadcast; `notified` are the couriers reached by this call.
    /// `round` counts from 1, same as `OfferCreated.round`
    Offered { round: u32, notified: Vec<String> },
    /// No eligible courier; waits for a courier to come online
    Waiting,
}

/// Successful assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub order_id: String,
    pub courier_id: String,
    pub assigned_at: i64,
}

/// Result of `accept_offer`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    Assigned(Assignment),
    /// Another courier won; a normal outcome, not an error
    RaceLost,
}

/// Result of `reject_offer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectOutcome {
    /// Courier removed from the candidates
    Recorded { remaining: usize },
    /// Courier was not a candidate
    Ignored,
    /// Last candidate rejected; the order was escalated
    Escalated,
}

/// Windows for the three order timeouts
#[derive(Debug, Clone, Copy)]
pub struct DispatchWindows {
    pub assignment: Duration,
    pub pickup: Duration,
    pub delivery: Duration,
}

impl DispatchWindows {
    pub fn from_config(config: &Config) -> Self {
        Self {
            assignment: config.timeout_delay(TimeoutKind::RiderAssignment),
            pickup: config.timeout_delay(TimeoutKind::Pickup),
            delivery: config.timeout_delay(TimeoutKind::Delivery),
        }
    }
}

pub struct DispatchCoordinator {
    storage: DispatchStorage,
    offers: OfferBook,
    scheduler: TimeoutScheduler,
    router: Arc<NotificationRouter>,
    windows: DispatchWindows,
}

impl std::fmt::Debug for DispatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchCoordinator")
            .field("live_offers", &self.offers.live_count())
            .field("windows", &self.windows)
            .finish_non_exhaustive()
    }
}

impl DispatchCoordinator {
    pub fn new(
        storage: DispatchStorage,
        scheduler: TimeoutScheduler,
        router: Arc<NotificationRouter>,
        windows: DispatchWindows,
    ) -> Self {
        Self {
            storage,
            offers: OfferBook::new(),
            scheduler,
            router,
            windows,
        }
    }

    pub fn offers(&self) -> &OfferBook {
        &self.offers
    }

    pub fn scheduler(&self) -> &TimeoutScheduler {
        &self.scheduler
    }

    // ========== Offers ==========

    /// An order became READY_FOR_PICKUP: offer it to every eligible courier
    pub async fn submit_ready_order(&self, order_id: &str) -> AppResult<SubmitOutcome> {
        let order = self.require_order(order_id)?;
        if order.status != OrderStatus::ReadyForPickup || order.rider_id.is_some() {
            return Err(AppError::invalid_state(
                order_id,
                format!("cannot dispatch an order in {}", order.status),
            ));
        }
        let order = if order.escalated_at.is_some() {
            tracing::info!(order_id = %order_id, "Escalated order resubmitted");
            self.storage.clear_escalation(order_id)?
        } else {
            order
        };

        let eligible: Vec<String> = self
            .storage
            .available_couriers()?
            .into_iter()
            .map(|c| c.id)
            .collect();

        if eligible.is_empty() && self.offers.get(order_id).is_none() {
            tracing::info!(order_id = %order_id, "No courier online, order waiting");
            return Ok(SubmitOutcome::Waiting);
        }

        let notified = self.offer_to(&order, &eligible).await?;
        let round = self.offers.get(order_id).map(|o| o.round()).unwrap_or(0);
        tracing::info!(
            order_id = %order_id,
            round,
            notified = notified.len(),
            "Order offered"
        );
        Ok(SubmitOutcome::Offered { round, notified })
    }

    /// Offer every waiting order to a courier who just came online (or was
    /// freed). Couriers already holding an offer are not notified again.
    pub async fn on_courier_came_online(&self, courier_id: &str) -> AppResult<usize> {
        let courier = self
            .storage
            .get_courier(courier_id)?
            .ok_or_else(|| AppError::courier_not_found(courier_id))?;
        if !courier.can_take_orders() {
            return Ok(0);
        }
        if let Some(active) = self.storage.active_order_of(courier_id)? {
            tracing::debug!(courier_id = %courier_id, active_order = %active, "Courier busy, skip recheck");
            return Ok(0);
        }

        let eligible = [courier_id.to_string()];
        let mut offered = 0;
        for order in self.storage.waiting_orders()? {
            if self.offers.has_rejected(&order.id, courier_id) {
                continue;
            }
            let notified = self.offer_to(&order, &eligible).await?;
            offered += notified.len();
        }

        if offered > 0 {
            tracing::info!(courier_id = %courier_id, offered, "Waiting orders offered");
        }
        Ok(offered)
    }

    /// Add `eligible` to the order's offer (opening a round if needed),
    /// arm the assignment timer for a new round and notify the added
    /// couriers. Returns the couriers notified.
    async fn offer_to(&self, order: &Order, eligible: &[String]) -> AppResult<Vec<String>> {
        let update = self
            .offers
            .open_or_extend(&order.id, eligible, self.windows.assignment);

        if update.new_round {
            // The order may have been taken between the read and the round opening
            let still_waiting = self
                .storage
                .get_order(&order.id)?
                .is_some_and(|o| o.is_waiting_for_rider());
            if !still_waiting {
                self.offers.retire(&order.id);
                return Ok(Vec::new());
            }
            self.scheduler.arm(
                &order.id,
                TimeoutKind::RiderAssignment,
                self.windows.assignment,
            )?;
        }

        let notification = Notification::OfferCreated {
            order_id: order.id.clone(),
            vendor_id: order.vendor_id.clone(),
            delivery_address: order.delivery_address,
            expires_at: update.expires_at,
            round: update.retry_count + 1,
        };
        let targets: Vec<Target> = update
            .added
            .iter()
            .map(|id| Target::Courier(id.clone()))
            .collect();
        self.router.notify_all(&targets, notification).await;

        Ok(update.added)
    }

    /// First accept wins
    pub async fn accept_offer(&self, order_id: &str, courier_id: &str) -> AppResult<AcceptOutcome> {
        if self.offers.has_rejected(order_id, courier_id) {
            return Err(AppError::invalid_state(
                order_id,
                format!("courier {} rejected this offer", courier_id),
            ));
        }

        let order = match self.storage.try_assign(order_id, courier_id)? {
            AssignAttempt::Assigned(order) => order,
            AssignAttempt::AlreadyTaken {
                rider_id: Some(rider_id),
                status,
            } if rider_id == courier_id => {
                // Repeated accept from the winner
                let order = self.require_order(order_id)?;
                tracing::debug!(order_id = %order_id, courier_id = %courier_id, %status, "Duplicate accept");
                return Ok(AcceptOutcome::Assigned(Assignment {
                    order_id: order_id.to_string(),
                    courier_id: courier_id.to_string(),
                    assigned_at: order.assigned_at.unwrap_or_default(),
                }));
            }
            AssignAttempt::AlreadyTaken { status, .. } => {
                tracing::info!(order_id = %order_id, courier_id = %courier_id, %status, "Offer race lost");
                return Ok(AcceptOutcome::RaceLost);
            }
            AssignAttempt::Terminal(status) => {
                return Err(AppError::invalid_state(
                    order_id,
                    format!("order is already {}", status),
                ));
            }
            AssignAttempt::CourierBusy { active_order_id } => {
                return Err(AppError::invalid_state(
                    order_id,
                    format!("courier {} already holds order {}", courier_id, active_order_id),
                ));
            }
        };

        tracing::info!(order_id = %order_id, courier_id = %courier_id, "Order assigned");

        // Committed: the follow-ups below are best-effort
        if let Err(e) = self.scheduler.disarm(order_id, TimeoutKind::RiderAssignment) {
            tracing::warn!(order_id = %order_id, error = %e, "Failed to disarm assignment timeout");
        }
        if let Err(e) = self
            .scheduler
            .arm(order_id, TimeoutKind::Pickup, self.windows.pickup)
        {
            tracing::error!(order_id = %order_id, error = %e, "Failed to arm pickup timeout");
        }

        if let Some(offer) = self.offers.finish(order_id) {
            let others: Vec<Target> = offer
                .candidates
                .iter()
                .filter(|id| id.as_str() != courier_id)
                .map(|id| Target::Courier(id.clone()))
                .collect();
            self.router
                .notify_all(
                    &others,
                    Notification::OfferWithdrawn {
                        order_id: order_id.to_string(),
                        reason: WithdrawReason::TakenByOther,
                    },
                )
                .await;
        }

        self.router
            .notify_all(
                &[
                    Target::Courier(courier_id.to_string()),
                    Target::Customer(order.customer_id.clone()),
                    Target::Vendor(order.vendor_id.clone()),
                    Target::Order(order.id.clone()),
                ],
                Notification::OrderAssigned {
                    order_id: order.id.clone(),
                    rider_id: courier_id.to_string(),
                },
            )
            .await;

        Ok(AcceptOutcome::Assigned(Assignment {
            order_id: order.id,
            courier_id: courier_id.to_string(),
            assigned_at: order.assigned_at.unwrap_or_default(),
        }))
    }

    /// Courier declines; the last rejection escalates immediately
    pub async fn reject_offer(&self, order_id: &str, courier_id: &str) -> AppResult<RejectOutcome> {
        match self.offers.reject(order_id, courier_id) {
            Rejection::NoOffer => Err(AppError::not_found(format!("offer for order {}", order_id))),
            Rejection::NotCandidate => Ok(RejectOutcome::Ignored),
            Rejection::Removed { remaining } if remaining > 0 => {
                tracing::debug!(order_id = %order_id, courier_id = %courier_id, remaining, "Offer rejected");
                Ok(RejectOutcome::Recorded { remaining })
            }
            Rejection::Removed { .. } => {
                tracing::info!(order_id = %order_id, "All candidates rejected, escalating");
                self.scheduler.disarm(order_id, TimeoutKind::RiderAssignment)?;
                self.escalate(order_id, ALL_REJECTED_REASON).await?;
                Ok(RejectOutcome::Escalated)
            }
        }
    }

    /// Hand the order over to manual assignment
    ///
    /// Returns false if the order is no longer waiting for a courier.
    async fn escalate(&self, order_id: &str, reason: &str) -> AppResult<bool> {
        match self.storage.mark_escalated(order_id)? {
            StatusUpdate::Mismatch(order) => {
                tracing::debug!(order_id = %order_id, status = %order.status, "Order no longer waiting, escalation skipped");
                return Ok(false);
            }
            StatusUpdate::Applied(_) => {}
        }

        let rounds = self.offers.rounds(order_id);
        let offer = self.offers.retire(order_id);

        tracing::warn!(order_id = %order_id, rounds, reason = %reason, "Order escalated for manual assignment");

        if let Some(offer) = offer {
            let holders: Vec<Target> = offer
                .candidates
                .iter()
                .map(|id| Target::Courier(id.clone()))
                .collect();
            self.router
                .notify_all(
                    &holders,
                    Notification::OfferWithdrawn {
                        order_id: order_id.to_string(),
                        reason: WithdrawReason::Escalated,
                    },
                )
                .await;
        }

        self.router
            .notify_all(
                &[Target::Admin],
                Notification::AssignmentEscalated {
                    order_id: order_id.to_string(),
                    reason: reason.to_string(),
                    rounds,
                },
            )
            .await;
        Ok(true)
    }

    // ========== Lifecycle ==========

    /// Cancel from any non-terminal status
    pub async fn cancel_order(&self, order_id: &str, reason: &str) -> AppResult<Order> {
        match self.storage.cancel_order(order_id, reason, None)? {
            StatusUpdate::Applied(order) => {
                self.after_cancel(&order, reason).await;
                Ok(order)
            }
            StatusUpdate::Mismatch(order) => Err(AppError::invalid_transition(
                order_id,
                order.status,
                OrderStatus::Cancelled,
            )),
        }
    }

    async fn after_cancel(&self, order: &Order, reason: &str) {
        tracing::info!(order_id = %order.id, reason = %reason, "Order cancelled");

        if let Err(e) = self.scheduler.disarm_all(&order.id) {
            tracing::warn!(order_id = %order.id, error = %e, "Failed to disarm timeouts");
        }

        if let Some(offer) = self.offers.finish(&order.id) {
            let holders: Vec<Target> = offer
                .candidates
                .iter()
                .map(|id| Target::Courier(id.clone()))
                .collect();
            self.router
                .notify_all(
                    &holders,
                    Notification::OfferWithdrawn {
                        order_id: order.id.clone(),
                        reason: WithdrawReason::OrderCancelled,
                    },
                )
                .await;
        }

        let mut targets = vec![
            Target::Order(order.id.clone()),
            Target::Customer(order.customer_id.clone()),
            Target::Vendor(order.vendor_id.clone()),
        ];
        if let Some(rider_id) = &order.rider_id {
            targets.push(Target::Courier(rider_id.clone()));
        }
        self.router
            .notify_all(
                &targets,
                Notification::OrderCancelled {
                    order_id: order.id.clone(),
                    reason: reason.to_string(),
                },
            )
            .await;

        if let Some(rider_id) = &order.rider_id {
            self.offer_waiting_to_freed(rider_id).await;
        }
    }

    /// ASSIGNED -> PICKED_UP
    pub async fn confirm_pickup(&self, order_id: &str, courier_id: &str) -> AppResult<Order> {
        let order = self
            .advance(order_id, courier_id, OrderStatus::Assigned, OrderStatus::PickedUp)
            .await?;
        if let Err(e) = self.scheduler.disarm(order_id, TimeoutKind::Pickup) {
            tracing::warn!(order_id = %order_id, error = %e, "Failed to disarm pickup timeout");
        }
        if let Err(e) = self
            .scheduler
            .arm(order_id, TimeoutKind::Delivery, self.windows.delivery)
        {
            tracing::error!(order_id = %order_id, error = %e, "Failed to arm delivery timeout");
        }
        Ok(order)
    }

    /// PICKED_UP -> OUT_FOR_DELIVERY
    pub async fn start_delivery(&self, order_id: &str, courier_id: &str) -> AppResult<Order> {
        self.advance(
            order_id,
            courier_id,
            OrderStatus::PickedUp,
            OrderStatus::OutForDelivery,
        )
        .await
    }

    /// OUT_FOR_DELIVERY -> DELIVERED; the freed courier is offered waiting work
    pub async fn confirm_delivery(&self, order_id: &str, courier_id: &str) -> AppResult<Order> {
        let order = self
            .advance(
                order_id,
                courier_id,
                OrderStatus::OutForDelivery,
                OrderStatus::Delivered,
            )
            .await?;
        if let Err(e) = self.scheduler.disarm_all(order_id) {
            tracing::warn!(order_id = %order_id, error = %e, "Failed to disarm delivery timeout");
        }
        self.offers.finish(order_id);
        self.offer_waiting_to_freed(courier_id).await;
        Ok(order)
    }

    async fn advance(
        &self,
        order_id: &str,
        courier_id: &str,
        from: OrderStatus,
        to: OrderStatus,
    ) -> AppResult<Order> {
        let order = match self.storage.advance_status(order_id, courier_id, from, to)? {
            StatusUpdate::Applied(order) => order,
            StatusUpdate::Mismatch(order) if order.rider_id.as_deref() != Some(courier_id) => {
                return Err(AppError::invalid_state(
                    order_id,
                    format!("order is not assigned to courier {}", courier_id),
                ));
            }
            StatusUpdate::Mismatch(order) => {
                return Err(AppError::invalid_transition(order_id, order.status, to));
            }
        };

        tracing::info!(order_id = %order_id, courier_id = %courier_id, status = %to, "Order status changed");
        self.router
            .notify_all(
                &[
                    Target::Order(order.id.clone()),
                    Target::Customer(order.customer_id.clone()),
                    Target::Vendor(order.vendor_id.clone()),
                ],
                Notification::OrderStatusChanged {
                    order_id: order.id.clone(),
                    status: to,
                    rider_id: Some(courier_id.to_string()),
                },
            )
            .await;
        Ok(order)
    }

    async fn offer_waiting_to_freed(&self, courier_id: &str) {
        if let Err(e) = self.on_courier_came_online(courier_id).await {
            tracing::warn!(courier_id = %courier_id, error = %e, "Failed to offer waiting orders to freed courier");
        }
    }

    // ========== Timeouts ==========

    /// Timeout handler; re-validates the order before acting
    pub async fn handle_timeout(&self, order_id: &str, kind: TimeoutKind) -> AppResult<()> {
        match kind {
            TimeoutKind::RiderAssignment => {
                let order = self.require_order(order_id)?;
                if !order.is_waiting_for_rider() {
                    return Err(AppError::invalid_state(
                        order_id,
                        format!("assignment timeout on order in {}", order.status),
                    ));
                }
                self.escalate(order_id, ASSIGNMENT_TIMEOUT_REASON).await?;
                Ok(())
            }
            TimeoutKind::Pickup => {
                match self
                    .storage
                    .cancel_order(order_id, PICKUP_TIMEOUT_REASON, Some(OrderStatus::Assigned))?
                {
                    StatusUpdate::Applied(order) => {
                        tracing::warn!(order_id = %order_id, rider_id = ?order.rider_id, "Pickup window expired, order cancelled");
                        self.after_cancel(&order, PICKUP_TIMEOUT_REASON).await;
                        Ok(())
                    }
                    StatusUpdate::Mismatch(order) => Err(AppError::invalid_state(
                        order_id,
                        format!("pickup timeout on order in {}", order.status),
                    )),
                }
            }
            TimeoutKind::Delivery => {
                let order = self.require_order(order_id)?;
                if order.status.is_terminal() {
                    return Err(AppError::invalid_state(
                        order_id,
                        format!("delivery timeout on order in {}", order.status),
                    ));
                }
                tracing::warn!(
                    order_id = %order_id,
                    status = %order.status,
                    rider_id = ?order.rider_id,
                    "Delivery window exceeded"
                );
                Ok(())
            }
        }
    }

    fn require_order(&self, order_id: &str) -> AppResult<Order> {
        self.storage
            .get_order(order_id)?
            .ok_or_else(|| AppError::order_not_found(order_id))
    }
}

#[async_trait]
impl WaitingOrdersRecheck for DispatchCoordinator {
    async fn recheck_waiting_orders(&self, courier_id: &str) -> AppResult<usize> {
        self.on_courier_came_online(courier_id).await
    }
}

#[async_trait]
impl TimeoutHandler for DispatchCoordinator {
    async fn handle_timeout(&self, order_id: &str, kind: TimeoutKind) -> AppResult<()> {
        DispatchCoordinator::handle_timeout(self, order_id, kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBus;
    use crate::notify::LogPushGateway;
    use crate::timeouts::JobQueue;
    use shared::message::Topic;
    use shared::order::{Courier, GeoPoint};

    struct Fixture {
        coordinator: Arc<DispatchCoordinator>,
        storage: DispatchStorage,
        router: Arc<NotificationRouter>,
        bus: MessageBus,
    }

    fn fixture() -> Fixture {
        let storage = DispatchStorage::open_in_memory().unwrap();
        let bus = MessageBus::new();
        let router = Arc::new(NotificationRouter::new(
            storage.clone(),
            Arc::new(bus.clone()),
            Arc::new(LogPushGateway),
        ));
        let scheduler = TimeoutScheduler::new(JobQueue::new(
            storage.clone(),
            3,
            Duration::from_millis(100),
            Duration::from_secs(30),
        ));
        let windows = DispatchWindows {
            assignment: Duration::from_secs(120),
            pickup: Duration::from_secs(1800),
            delivery: Duration::from_secs(3600),
        };
        let coordinator = Arc::new(DispatchCoordinator::new(
            storage.clone(),
            scheduler,
            router.clone(),
            windows,
        ));
        Fixture {
            coordinator,
            storage,
            router,
            bus,
        }
    }

    impl Fixture {
        fn order(&self, id: &str) {
            self.storage
                .upsert_order(&Order::ready(id, "v1", "c1", GeoPoint::new(31.2, 121.4)))
                .unwrap();
        }

        fn courier(&self, id: &str, online: bool) {
            let mut courier = Courier::new(id);
            courier.is_online = online;
            self.storage.upsert_courier(&courier).unwrap();
        }

        fn armed(&self, order_id: &str) -> Vec<TimeoutKind> {
            self.coordinator.scheduler().armed(order_id).unwrap()
        }

        fn status(&self, order_id: &str) -> OrderStatus {
            self.storage.require_order(order_id).unwrap().status
        }
    }

    #[tokio::test]
    async fn test_submit_without_couriers_waits_without_timer() {
        let f = fixture();
        f.order("o1");

        let outcome = f.coordinator.submit_ready_order("o1").await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Waiting);
        assert!(f.armed("o1").is_empty());
        assert_eq!(f.coordinator.offers().live_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_offers_to_online_available_couriers() {
        let f = fixture();
        f.order("o1");
        f.courier("r1", true);
        f.courier("r2", true);
        f.courier("r3", false);

        let outcome = f.coordinator.submit_ready_order("o1").await.unwrap();
        let SubmitOutcome::Offered { round, mut notified } = outcome else {
            panic!("expected offer");
        };
        notified.sort();
        assert_eq!(round, 1);
        assert_eq!(notified, vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(f.armed("o1"), vec![TimeoutKind::RiderAssignment]);

        // The parked offer carries the same round number
        let parked = f.storage.pending_notifications("rider:r1").unwrap();
        assert!(matches!(
            parked[0].1.notification,
            Notification::OfferCreated { round: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_submit_rejects_unknown_and_assigned_orders() {
        let f = fixture();
        f.order("o1");
        f.courier("r1", true);

        assert!(matches!(
            f.coordinator.submit_ready_order("nope").await,
            Err(AppError::NotFound(_))
        ));

        f.coordinator.accept_offer("o1", "r1").await.unwrap();
        assert!(matches!(
            f.coordinator.submit_ready_order("o1").await,
            Err(AppError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_accept_assigns_and_withdraws_from_others() {
        let f = fixture();
        f.order("o1");
        f.courier("r1", true);
        f.courier("r2", true);
        f.router.connect(&Target::Courier("r1".into())).await.unwrap();
        let mut r1 = f.bus.subscribe_topic(Topic::Rider("r1".into()));

        f.coordinator.submit_ready_order("o1").await.unwrap();
        let outcome = f.coordinator.accept_offer("o1", "r2").await.unwrap();
        assert!(matches!(outcome, AcceptOutcome::Assigned(ref a) if a.courier_id == "r2"));

        let order = f.storage.require_order("o1").unwrap();
        assert_eq!(order.status, OrderStatus::Assigned);
        assert_eq!(order.rider_id.as_deref(), Some("r2"));
        assert_eq!(f.armed("o1"), vec![TimeoutKind::Pickup]);
        assert_eq!(f.coordinator.offers().live_count(), 0);

        // r1 saw the offer, then its withdrawal
        let created = r1.recv().await.unwrap();
        assert!(matches!(created.notification, Notification::OfferCreated { .. }));
        let withdrawn = r1.recv().await.unwrap();
        assert_eq!(
            withdrawn.notification,
            Notification::OfferWithdrawn {
                order_id: "o1".into(),
                reason: WithdrawReason::TakenByOther,
            }
        );

        assert_eq!(
            f.coordinator.accept_offer("o1", "r1").await.unwrap(),
            AcceptOutcome::RaceLost
        );
        // Winner retrying gets the same assignment back
        assert!(matches!(
            f.coordinator.accept_offer("o1", "r2").await.unwrap(),
            AcceptOutcome::Assigned(_)
        ));
    }

    #[tokio::test]
    async fn test_rejecting_courier_cannot_accept_or_be_reoffered() {
        let f = fixture();
        f.order("o1");
        f.courier("r1", true);
        f.courier("r2", true);
        f.coordinator.submit_ready_order("o1").await.unwrap();

        assert_eq!(
            f.coordinator.reject_offer("o1", "r1").await.unwrap(),
            RejectOutcome::Recorded { remaining: 1 }
        );
        assert_eq!(
            f.coordinator.reject_offer("o1", "r1").await.unwrap(),
            RejectOutcome::Ignored
        );
        assert!(matches!(
            f.coordinator.accept_offer("o1", "r1").await,
            Err(AppError::InvalidStateTransition { .. })
        ));

        // r1 reconnecting does not bring the offer back
        assert_eq!(f.coordinator.on_courier_came_online("r1").await.unwrap(), 0);
        let offer = f.coordinator.offers().get("o1").unwrap();
        assert!(!offer.candidates.contains("r1"));
    }

    #[tokio::test]
    async fn test_last_rejection_escalates_immediately() {
        let f = fixture();
        f.order("o1");
        f.courier("r1", true);
        f.router.connect(&Target::Admin).await.unwrap();
        let mut admin = f.bus.subscribe_topic(Topic::Admin);

        f.coordinator.submit_ready_order("o1").await.unwrap();
        assert_eq!(
            f.coordinator.reject_offer("o1", "r1").await.unwrap(),
            RejectOutcome::Escalated
        );

        let order = f.storage.require_order("o1").unwrap();
        assert_eq!(order.status, OrderStatus::ReadyForPickup);
        assert!(order.escalated_at.is_some());
        assert!(f.armed("o1").is_empty());

        let msg = admin.recv().await.unwrap();
        assert!(matches!(
            msg.notification,
            Notification::AssignmentEscalated { rounds: 1, .. }
        ));

        // Escalated orders are not auto re-offered
        f.courier("r2", true);
        assert_eq!(f.coordinator.on_courier_came_online("r2").await.unwrap(), 0);

        // Manual resubmit opens round 2 with r1 eligible again
        let outcome = f.coordinator.submit_ready_order("o1").await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Offered { round: 2, ref notified } if notified.len() == 2));
        let parked = f.storage.pending_notifications("rider:r2").unwrap();
        assert!(matches!(
            parked.last().unwrap().1.notification,
            Notification::OfferCreated { round: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_reject_without_offer_is_not_found() {
        let f = fixture();
        f.order("o1");
        assert!(matches!(
            f.coordinator.reject_offer("o1", "r1").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_courier_online_is_idempotent() {
        let f = fixture();
        f.order("o1");
        f.order("o2");
        f.coordinator.submit_ready_order("o1").await.unwrap();

        f.courier("r1", true);
        assert_eq!(f.coordinator.on_courier_came_online("r1").await.unwrap(), 2);
        assert_eq!(f.coordinator.on_courier_came_online("r1").await.unwrap(), 0);
        assert_eq!(f.armed("o1"), vec![TimeoutKind::RiderAssignment]);
        assert_eq!(f.armed("o2"), vec![TimeoutKind::RiderAssignment]);

        f.courier("r9", false);
        assert_eq!(f.coordinator.on_courier_came_online("r9").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_busy_courier_gets_no_offers_and_cannot_accept() {
        let f = fixture();
        f.order("o1");
        f.order("o2");
        f.courier("r1", true);

        f.coordinator.submit_ready_order("o1").await.unwrap();
        f.coordinator.accept_offer("o1", "r1").await.unwrap();

        assert_eq!(f.coordinator.on_courier_came_online("r1").await.unwrap(), 0);
        assert_eq!(
            f.coordinator.submit_ready_order("o2").await.unwrap(),
            SubmitOutcome::Waiting
        );
        assert!(matches!(
            f.coordinator.accept_offer("o2", "r1").await,
            Err(AppError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_full_lifecycle_frees_courier_for_waiting_work() {
        let f = fixture();
        f.order("o1");
        f.courier("r1", true);
        f.coordinator.submit_ready_order("o1").await.unwrap();
        f.coordinator.accept_offer("o1", "r1").await.unwrap();

        // Wrong courier / wrong order of steps
        f.courier("r2", true);
        assert!(f.coordinator.confirm_pickup("o1", "r2").await.is_err());
        assert!(matches!(
            f.coordinator.confirm_delivery("o1", "r1").await,
            Err(AppError::InvalidStateTransition { .. })
        ));

        f.coordinator.confirm_pickup("o1", "r1").await.unwrap();
        assert_eq!(f.armed("o1"), vec![TimeoutKind::Delivery]);
        f.coordinator.start_delivery("o1", "r1").await.unwrap();

        f.order("o2");
        // r2 went offline before o2 arrived, so only the freed r1 can take it
        f.storage.set_courier_online("r2", false).unwrap();
        f.coordinator.confirm_delivery("o1", "r1").await.unwrap();

        assert_eq!(f.status("o1"), OrderStatus::Delivered);
        assert!(f.armed("o1").is_empty());
        let offer = f.coordinator.offers().get("o2").unwrap();
        assert!(offer.candidates.contains("r1"));

        // Terminal: nothing moves any more
        assert!(f.coordinator.cancel_order("o1", "late").await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_retires_offer_and_timers() {
        let f = fixture();
        f.order("o1");
        f.courier("r1", true);
        f.coordinator.submit_ready_order("o1").await.unwrap();

        let order = f.coordinator.cancel_order("o1", "customer request").await.unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.cancellation_reason.as_deref(), Some("customer request"));
        assert!(f.armed("o1").is_empty());
        assert_eq!(f.coordinator.offers().live_count(), 0);

        assert!(matches!(
            f.coordinator.accept_offer("o1", "r1").await,
            Err(AppError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_assigned_order_releases_courier() {
        let f = fixture();
        f.order("o1");
        f.courier("r1", true);
        f.coordinator.submit_ready_order("o1").await.unwrap();
        f.coordinator.accept_offer("o1", "r1").await.unwrap();

        f.coordinator.cancel_order("o1", "vendor closed").await.unwrap();
        assert_eq!(f.storage.active_order_of("r1").unwrap(), None);
        assert!(f.storage.get_courier("r1").unwrap().unwrap().is_available);
    }

    #[tokio::test]
    async fn test_timeouts_revalidate_state() {
        let f = fixture();
        f.order("o1");
        f.courier("r1", true);
        f.coordinator.submit_ready_order("o1").await.unwrap();
        f.coordinator.accept_offer("o1", "r1").await.unwrap();

        // Assignment timer raced with the accept: stale
        let err = f
            .coordinator
            .handle_timeout("o1", TimeoutKind::RiderAssignment)
            .await
            .unwrap_err();
        assert!(err.is_stale());
        assert!(f.storage.require_order("o1").unwrap().escalated_at.is_none());

        f.coordinator.confirm_pickup("o1", "r1").await.unwrap();
        let err = f
            .coordinator
            .handle_timeout("o1", TimeoutKind::Pickup)
            .await
            .unwrap_err();
        assert!(err.is_stale());
        assert_eq!(f.status("o1"), OrderStatus::PickedUp);

        // Delivery hook only logs
        f.coordinator
            .handle_timeout("o1", TimeoutKind::Delivery)
            .await
            .unwrap();
        assert_eq!(f.status("o1"), OrderStatus::PickedUp);

        assert!(f
            .coordinator
            .handle_timeout("missing", TimeoutKind::Pickup)
            .await
            .unwrap_err()
            .is_stale());
    }

    #[tokio::test]
    async fn test_pickup_timeout_cancels_unpicked_order() {
        let f = fixture();
        f.order("o1");
        f.courier("r1", true);
        f.coordinator.submit_ready_order("o1").await.unwrap();
        f.coordinator.accept_offer("o1", "r1").await.unwrap();

        f.coordinator
            .handle_timeout("o1", TimeoutKind::Pickup)
            .await
            .unwrap();
        let order = f.storage.require_order("o1").unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.cancellation_reason.as_deref(), Some(PICKUP_TIMEOUT_REASON));
        assert!(f.storage.get_courier("r1").unwrap().unwrap().is_available);
    }

    #[tokio::test]
    async fn test_assignment_timeout_escalates_waiting_order() {
        let f = fixture();
        f.order("o1");
        f.courier("r1", true);
        f.coordinator.submit_ready_order("o1").await.unwrap();

        f.coordinator
            .handle_timeout("o1", TimeoutKind::RiderAssignment)
            .await
            .unwrap();
        let order = f.storage.require_order("o1").unwrap();
        assert_eq!(order.status, OrderStatus::ReadyForPickup);
        assert!(order.escalated_at.is_some());
        assert_eq!(f.coordinator.offers().live_count(), 0);

        // A second delivery of the same job is stale
        assert!(f
            .coordinator
            .handle_timeout("o1", TimeoutKind::RiderAssignment)
            .await
            .unwrap_err()
            .is_stale());
    }
}
