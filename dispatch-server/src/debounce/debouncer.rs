//! 骑手上下线去抖
//!
//! ```text
//! online ─┐ offline ─┐ online ─┐
//!         ▼          ▼         ▼
//!   persist     persist     persist
//!   schedule ─X cancel      schedule ── window ──▶ recheck_waiting_orders()
//! ```
//!
//! `is_online` is written immediately; only the "recheck waiting orders"
//! side effect is deferred. Each new toggle replaces the pending recheck, so
//! a burst produces exactly one recheck after the window goes quiet.
//!
//! Connection events ([`EventDebouncer::handle_status_change`]) hold the
//! courier's `status_change` lock from the online write until the recheck
//! finishes or is cancelled. Offline events take no lock and are never
//! skipped; cancelling the pending recheck releases the lock at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::locks::{LockKey, ProcessingGuard, ProcessingLocks};
use crate::storage::DispatchStorage;
use crate::utils::AppResult;

/// Side effect run once a courier's online status settles
#[async_trait]
pub trait WaitingOrdersRecheck: Send + Sync {
    /// Offer waiting orders to the courier; returns how many were offered
    async fn recheck_waiting_orders(&self, courier_id: &str) -> AppResult<usize>;
}

struct PendingRecheck {
    generation: u64,
    token: CancellationToken,
    /// Connection-level lock, released with the slot
    _guard: Option<ProcessingGuard>,
}

pub struct EventDebouncer {
    storage: DispatchStorage,
    window: Duration,
    recheck: Arc<dyn WaitingOrdersRecheck>,
    locks: ProcessingLocks,
    pending: Arc<DashMap<String, PendingRecheck>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for EventDebouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDebouncer")
            .field("window", &self.window)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl EventDebouncer {
    pub fn new(
        storage: DispatchStorage,
        window: Duration,
        recheck: Arc<dyn WaitingOrdersRecheck>,
    ) -> Self {
        Self {
            storage,
            window,
            recheck,
            locks: ProcessingLocks::new(),
            pending: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn locks(&self) -> &ProcessingLocks {
        &self.locks
    }

    /// Connection event entry point
    ///
    /// An online event is ignored (returns false) while an earlier online
    /// event for the same courier is in flight, i.e. its window is open or
    /// its recheck is running. Offline events always apply.
    pub async fn handle_status_change(&self, courier_id: &str, is_online: bool) -> AppResult<bool> {
        if !is_online {
            self.debounce(courier_id, false)?;
            return Ok(true);
        }

        let key = LockKey::new("courier", courier_id, "status_change");
        let Some(guard) = self.locks.acquire_or_skip(key) else {
            return Ok(false);
        };
        self.storage.set_courier_online(courier_id, true)?;
        self.schedule_recheck(courier_id, Some(guard));
        Ok(true)
    }

    /// Persist `is_online` now and (re)schedule or cancel the recheck
    pub fn debounce(&self, courier_id: &str, is_online: bool) -> AppResult<()> {
        self.storage.set_courier_online(courier_id, is_online)?;

        if is_online {
            self.schedule_recheck(courier_id, None);
        } else if let Some((_, pending)) = self.pending.remove(courier_id) {
            pending.token.cancel();
            tracing::debug!(courier_id = %courier_id, "Courier went offline, pending recheck cancelled");
        }
        Ok(())
    }

    fn schedule_recheck(&self, courier_id: &str, guard: Option<ProcessingGuard>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = self.shutdown.child_token();

        let replaced = self.pending.insert(
            courier_id.to_string(),
            PendingRecheck {
                generation,
                token: token.clone(),
                _guard: guard,
            },
        );
        if let Some(previous) = replaced {
            previous.token.cancel();
        }

        let courier_id = courier_id.to_string();
        let window = self.window;
        let pending = self.pending.clone();
        let recheck = self.recheck.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(window) => {}
            }

            // A newer toggle owns the slot if the generation moved on
            let Some((_, slot)) =
                pending.remove_if(&courier_id, |_, p| p.generation == generation)
            else {
                return;
            };

            match recheck.recheck_waiting_orders(&courier_id).await {
                Ok(offered) => {
                    tracing::debug!(courier_id = %courier_id, offered, "Waiting orders rechecked");
                }
                Err(e) => {
                    tracing::warn!(courier_id = %courier_id, error = %e, "Waiting orders recheck failed");
                }
            }
            drop(slot);
        });
    }

    /// Couriers with a recheck still waiting for the window to close
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Cancel every pending recheck
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.pending.clear();
        tracing::debug!("Event debouncer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use shared::order::Courier;

    #[derive(Default)]
    struct RecordingRecheck {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WaitingOrdersRecheck for RecordingRecheck {
        async fn recheck_waiting_orders(&self, courier_id: &str) -> AppResult<usize> {
            self.calls.lock().push(courier_id.to_string());
            Ok(0)
        }
    }

    const WINDOW: Duration = Duration::from_secs(3);

    fn debouncer() -> (EventDebouncer, DispatchStorage, Arc<RecordingRecheck>) {
        let storage = DispatchStorage::open_in_memory().unwrap();
        for id in ["r1", "r2"] {
            storage.upsert_courier(&Courier::new(id)).unwrap();
        }
        let recheck = Arc::new(RecordingRecheck::default());
        let debouncer = EventDebouncer::new(storage.clone(), WINDOW, recheck.clone());
        (debouncer, storage, recheck)
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_toggles_yields_one_recheck() {
        let (debouncer, storage, recheck) = debouncer();

        for i in 0..6 {
            debouncer.debounce("r1", i % 2 == 0).unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        // Last toggle was offline: nothing pending
        assert_eq!(debouncer.pending_count(), 0);
        debouncer.debounce("r1", true).unwrap();

        // Status persisted before the window closes
        assert!(storage.get_courier("r1").unwrap().unwrap().is_online);
        assert!(recheck.calls.lock().is_empty());

        tokio::time::sleep(WINDOW + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(*recheck.calls.lock(), vec!["r1".to_string()]);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_online_extends_window() {
        let (debouncer, _, recheck) = debouncer();

        debouncer.debounce("r1", true).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        debouncer.debounce("r1", true).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert!(recheck.calls.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        settle().await;
        assert_eq!(recheck.calls.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_cancels_pending_recheck() {
        let (debouncer, storage, recheck) = debouncer();

        debouncer.debounce("r1", true).unwrap();
        debouncer.debounce("r2", true).unwrap();
        debouncer.debounce("r1", false).unwrap();
        assert!(!storage.get_courier("r1").unwrap().unwrap().is_online);

        tokio::time::sleep(WINDOW * 2).await;
        settle().await;
        assert_eq!(*recheck.calls.lock(), vec!["r2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let (debouncer, _, recheck) = debouncer();
        debouncer.debounce("r1", true).unwrap();
        debouncer.shutdown();

        tokio::time::sleep(WINDOW * 2).await;
        settle().await;
        assert!(recheck.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_status_change_ignored_while_in_flight() {
        let (debouncer, storage, _) = debouncer();
        let _held = debouncer
            .locks()
            .try_acquire(LockKey::new("courier", "r1", "status_change"))
            .unwrap();

        assert!(!debouncer.handle_status_change("r1", true).await.unwrap());
        assert!(!storage.get_courier("r1").unwrap().unwrap().is_online);
        assert!(debouncer.handle_status_change("r2", true).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_event_in_flight_until_recheck_done() {
        let (debouncer, storage, recheck) = debouncer();
        let key = LockKey::new("courier", "r1", "status_change");

        assert!(debouncer.handle_status_change("r1", true).await.unwrap());
        assert!(debouncer.locks().is_held(&key));

        // Duplicate online inside the window is skipped, window not extended
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!debouncer.handle_status_change("r1", true).await.unwrap());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        settle().await;
        assert_eq!(*recheck.calls.lock(), vec!["r1".to_string()]);
        assert!(!debouncer.locks().is_held(&key));
        assert!(storage.get_courier("r1").unwrap().unwrap().is_online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_event_never_skipped_while_online_in_flight() {
        let (debouncer, storage, recheck) = debouncer();
        let key = LockKey::new("courier", "r1", "status_change");

        assert!(debouncer.handle_status_change("r1", true).await.unwrap());
        assert!(debouncer.handle_status_change("r1", false).await.unwrap());
        assert!(!storage.get_courier("r1").unwrap().unwrap().is_online);
        // Released synchronously, so an immediate reconnect is not lost
        assert!(!debouncer.locks().is_held(&key));
        assert!(debouncer.handle_status_change("r1", true).await.unwrap());
        assert!(storage.get_courier("r1").unwrap().unwrap().is_online);

        tokio::time::sleep(WINDOW + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(*recheck.calls.lock(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_courier_is_not_found() {
        let (debouncer, _, _) = debouncer();
        let err = debouncer.handle_status_change("ghost", true).await.unwrap_err();
        assert!(err.is_stale());
    }
}
