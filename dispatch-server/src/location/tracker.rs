//! 骑手位置跟踪
//!
//! 每个骑手保存最新位置和最近 50 条采样 (FIFO)。配送途中的订单
//! 会随位置更新重新计算 ETA 并推送给订单和顾客主题。

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use shared::message::{EtaUpdate, Notification};
use shared::order::{GeoPoint, LocationSample};

use super::geo::{eta_minutes, haversine_km};
use crate::notify::{NotificationRouter, Target};
use crate::storage::{DispatchStorage, StorageError};
use crate::utils::{AppError, AppResult};

/// 每个骑手保留的历史采样数
pub const HISTORY_CAPACITY: usize = 50;

pub struct LocationTracker {
    storage: DispatchStorage,
    router: Arc<NotificationRouter>,
    average_speed_kmh: f64,
    latest: DashMap<String, LocationSample>,
    history: DashMap<String, VecDeque<LocationSample>>,
}

impl std::fmt::Debug for LocationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationTracker")
            .field("average_speed_kmh", &self.average_speed_kmh)
            .field("tracked_couriers", &self.latest.len())
            .finish_non_exhaustive()
    }
}

impl LocationTracker {
    pub fn new(
        storage: DispatchStorage,
        router: Arc<NotificationRouter>,
        average_speed_kmh: f64,
    ) -> Self {
        Self {
            storage,
            router,
            average_speed_kmh,
            latest: DashMap::new(),
            history: DashMap::new(),
        }
    }

    /// Record a position sample
    ///
    /// When `order_id` names an order this courier is delivering, the ETA is
    /// recomputed and published to the order and customer topics.
    pub async fn ingest(
        &self,
        courier_id: &str,
        lat: f64,
        lng: f64,
        timestamp: i64,
        order_id: Option<&str>,
    ) -> AppResult<Option<EtaUpdate>> {
        if courier_id.is_empty() {
            return Err(AppError::validation("courier id is empty"));
        }
        let point = GeoPoint::new(lat, lng);
        if !point.is_valid() {
            return Err(AppError::validation(format!(
                "invalid coordinates ({}, {})",
                lat, lng
            )));
        }

        let sample = LocationSample {
            rider_id: courier_id.to_string(),
            lat,
            lng,
            timestamp,
        };
        self.record(sample);

        match self
            .storage
            .update_courier_position(courier_id, lat, lng, timestamp)
        {
            Ok(()) => {}
            Err(StorageError::CourierNotFound(_)) => {
                tracing::warn!(courier_id = %courier_id, "Position for unknown courier");
            }
            Err(e) => {
                tracing::warn!(courier_id = %courier_id, error = %e, "Failed to persist courier position");
            }
        }

        let Some(order_id) = order_id.filter(|id| !id.is_empty()) else {
            return Ok(None);
        };
        let Some(order) = self.storage.get_order(order_id)? else {
            tracing::debug!(order_id = %order_id, "Position tagged with unknown order");
            return Ok(None);
        };
        if !order.status.is_in_delivery() || order.rider_id.as_deref() != Some(courier_id) {
            return Ok(None);
        }

        let distance_km = haversine_km(point, order.delivery_address);
        let eta = eta_minutes(distance_km, self.average_speed_kmh);
        let update = EtaUpdate {
            order_id: order.id.clone(),
            rider_id: courier_id.to_string(),
            distance_km,
            eta_minutes: eta,
            estimated_arrival: shared::util::now_millis() + i64::from(eta) * 60_000,
            location: point,
        };

        tracing::debug!(
            order_id = %order.id,
            courier_id = %courier_id,
            distance_km,
            eta_minutes = eta,
            arrival = %shared::util::millis_to_rfc3339(update.estimated_arrival),
            "ETA updated"
        );
        self.router
            .notify_all(
                &[
                    Target::Order(order.id.clone()),
                    Target::Customer(order.customer_id.clone()),
                ],
                Notification::EtaUpdated(update.clone()),
            )
            .await;

        Ok(Some(update))
    }

    fn record(&self, sample: LocationSample) {
        let courier_id = sample.rider_id.clone();
        self.latest.insert(courier_id.clone(), sample.clone());

        let mut ring = self.history.entry(courier_id).or_default();
        while ring.len() >= HISTORY_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(sample);
    }

    /// Up to `limit` most recent samples, newest first
    pub fn get_history(&self, courier_id: &str, limit: usize) -> Vec<LocationSample> {
        self.history
            .get(courier_id)
            .map(|ring| ring.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent position
    pub fn latest(&self, courier_id: &str) -> Option<LocationSample> {
        self.latest.get(courier_id).map(|s| s.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBus;
    use crate::notify::LogPushGateway;
    use shared::message::Topic;
    use shared::order::{Courier, Order, OrderStatus};

    fn tracker() -> (LocationTracker, DispatchStorage, MessageBus) {
        let storage = DispatchStorage::open_in_memory().unwrap();
        let bus = MessageBus::new();
        let router = Arc::new(NotificationRouter::new(
            storage.clone(),
            Arc::new(bus.clone()),
            Arc::new(LogPushGateway),
        ));
        (LocationTracker::new(storage.clone(), router, 30.0), storage, bus)
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_newest_first() {
        let (tracker, _, _) = tracker();
        for i in 0..60 {
            tracker
                .ingest("r1", 31.0, 121.0 + i as f64 * 0.001, i, None)
                .await
                .unwrap();
        }

        let all = tracker.get_history("r1", 100);
        assert_eq!(all.len(), HISTORY_CAPACITY);
        assert_eq!(all[0].timestamp, 59);
        assert_eq!(all[49].timestamp, 10);

        let recent = tracker.get_history("r1", 3);
        let stamps: Vec<i64> = recent.iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![59, 58, 57]);

        // Reading does not consume
        assert_eq!(tracker.get_history("r1", 100).len(), HISTORY_CAPACITY);
        assert_eq!(tracker.latest("r1").unwrap().timestamp, 59);
        assert!(tracker.get_history("nobody", 10).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_samples_are_rejected() {
        let (tracker, _, _) = tracker();
        assert!(matches!(
            tracker.ingest("r1", 95.0, 0.0, 1, None).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            tracker.ingest("", 1.0, 1.0, 1, None).await,
            Err(AppError::Validation(_))
        ));
        assert!(tracker.latest("r1").is_none());
    }

    #[tokio::test]
    async fn test_eta_published_only_while_delivering() {
        let (tracker, storage, bus) = tracker();
        let mut courier = Courier::new("r1");
        courier.is_online = true;
        storage.upsert_courier(&courier).unwrap();
        storage
            .upsert_order(&Order::ready("o1", "v1", "c1", GeoPoint::new(0.0, 0.0)))
            .unwrap();
        storage.try_assign("o1", "r1").unwrap();

        // ASSIGNED: not yet delivering
        let eta = tracker.ingest("r1", 0.0, 0.1, 1, Some("o1")).await.unwrap();
        assert!(eta.is_none());

        storage
            .advance_status("o1", "r1", OrderStatus::Assigned, OrderStatus::PickedUp)
            .unwrap();
        let mut customer = bus.subscribe_topic(Topic::Customer("c1".into()));
        let mut order_topic = bus.subscribe_topic(Topic::Order("o1".into()));
        // Customer must be connected to get it live
        tracker
            .router
            .connect(&Target::Customer("c1".into()))
            .await
            .unwrap();

        let eta = tracker
            .ingest("r1", 0.0, 0.0001, 2, Some("o1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(eta.eta_minutes, 1);
        assert!(eta.distance_km < 0.1);

        let stored = storage.get_courier("r1").unwrap().unwrap();
        assert_eq!(stored.location_updated_at, Some(2));

        for sub in [&mut customer, &mut order_topic] {
            let msg = sub.recv().await.unwrap();
            assert!(matches!(msg.notification, Notification::EtaUpdated(ref u) if u.order_id == "o1"));
        }
    }

    #[tokio::test]
    async fn test_other_couriers_do_not_drive_eta() {
        let (tracker, storage, _) = tracker();
        let mut courier = Courier::new("r1");
        courier.is_online = true;
        storage.upsert_courier(&courier).unwrap();
        storage
            .upsert_order(&Order::ready("o1", "v1", "c1", GeoPoint::new(0.0, 0.0)))
            .unwrap();
        storage.try_assign("o1", "r1").unwrap();
        storage
            .advance_status("o1", "r1", OrderStatus::Assigned, OrderStatus::PickedUp)
            .unwrap();

        let eta = tracker.ingest("r2", 0.0, 0.1, 1, Some("o1")).await.unwrap();
        assert!(eta.is_none());
    }
}
