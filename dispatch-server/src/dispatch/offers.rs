//! 派单簿 - 内存中的派单轮次
//!
//! An offer lives from the moment an order is broadcast until it is
//! accepted, fully rejected, escalated or cancelled. Couriers that rejected
//! the current round never get it again in that round.

use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// 派单
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub order_id: String,
    /// Couriers still holding the offer
    pub candidates: HashSet<String>,
    /// Everyone notified in this round
    pub notified: HashSet<String>,
    /// Couriers that rejected in this round
    pub rejected: HashSet<String>,
    pub created_at: i64,
    pub expires_at: i64,
    /// Earlier rounds for the same order
    pub retry_count: u32,
}

impl Offer {
    /// Round number starting at 1
    pub fn round(&self) -> u32 {
        self.retry_count + 1
    }
}

/// Result of opening or extending an offer
#[derive(Debug, Clone, PartialEq)]
pub struct OfferUpdate {
    /// A new round was opened (the assignment timer must be armed)
    pub new_round: bool,
    pub retry_count: u32,
    pub expires_at: i64,
    /// Couriers added by this call, to be notified
    pub added: Vec<String>,
    /// Candidate count after the call
    pub candidates: usize,
}

/// Result of a rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No live offer for the order
    NoOffer,
    /// Courier was not a candidate (already rejected, or never offered)
    NotCandidate,
    /// Courier removed; `remaining` candidates left
    Removed { remaining: usize },
}

#[derive(Debug, Default)]
pub struct OfferBook {
    offers: DashMap<String, Offer>,
    /// order_id -> rounds opened so far
    rounds: DashMap<String, u32>,
}

impl OfferBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a round for `order_id`, or add `eligible` couriers to the live one
    ///
    /// Couriers already notified or that rejected the live round are skipped.
    pub fn open_or_extend(&self, order_id: &str, eligible: &[String], window: Duration) -> OfferUpdate {
        match self.offers.entry(order_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let offer = entry.get_mut();
                let mut added = Vec::new();
                for courier_id in eligible {
                    if offer.rejected.contains(courier_id) || offer.notified.contains(courier_id) {
                        continue;
                    }
                    offer.notified.insert(courier_id.clone());
                    offer.candidates.insert(courier_id.clone());
                    added.push(courier_id.clone());
                }
                OfferUpdate {
                    new_round: false,
                    retry_count: offer.retry_count,
                    expires_at: offer.expires_at,
                    added,
                    candidates: offer.candidates.len(),
                }
            }
            Entry::Vacant(entry) => {
                let retry_count = {
                    let mut rounds = self.rounds.entry(order_id.to_string()).or_insert(0);
                    let previous = *rounds;
                    *rounds += 1;
                    previous
                };
                let now = shared::util::now_millis();
                let expires_at =
                    now.saturating_add(i64::try_from(window.as_millis()).unwrap_or(i64::MAX));
                let couriers: HashSet<String> = eligible.iter().cloned().collect();
                let added: Vec<String> = {
                    let mut seen = HashSet::new();
                    eligible
                        .iter()
                        .filter(|id| seen.insert(id.as_str()))
                        .cloned()
                        .collect()
                };
                let candidates = couriers.len();
                entry.insert(Offer {
                    order_id: order_id.to_string(),
                    candidates: couriers.clone(),
                    notified: couriers,
                    rejected: HashSet::new(),
                    created_at: now,
                    expires_at,
                    retry_count,
                });
                OfferUpdate {
                    new_round: true,
                    retry_count,
                    expires_at,
                    added,
                    candidates,
                }
            }
        }
    }

    /// Remove a courier from the live offer's candidates
    pub fn reject(&self, order_id: &str, courier_id: &str) -> Rejection {
        let Some(mut offer) = self.offers.get_mut(order_id) else {
            return Rejection::NoOffer;
        };
        if !offer.candidates.remove(courier_id) {
            return Rejection::NotCandidate;
        }
        offer.rejected.insert(courier_id.to_string());
        Rejection::Removed {
            remaining: offer.candidates.len(),
        }
    }

    /// Did `courier_id` reject the live round?
    pub fn has_rejected(&self, order_id: &str, courier_id: &str) -> bool {
        self.offers
            .get(order_id)
            .is_some_and(|offer| offer.rejected.contains(courier_id))
    }

    /// Retire the live round; the round counter is kept so a later round
    /// continues numbering
    pub fn retire(&self, order_id: &str) -> Option<Offer> {
        self.offers.remove(order_id).map(|(_, offer)| offer)
    }

    /// Forget everything about the order (assigned or terminal)
    pub fn finish(&self, order_id: &str) -> Option<Offer> {
        self.rounds.remove(order_id);
        self.retire(order_id)
    }

    pub fn get(&self, order_id: &str) -> Option<Offer> {
        self.offers.get(order_id).map(|o| o.clone())
    }

    /// Rounds opened so far for the order
    pub fn rounds(&self, order_id: &str) -> u32 {
        self.rounds.get(order_id).map(|r| *r).unwrap_or(0)
    }

    pub fn live_count(&self) -> usize {
        self.offers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(120);

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_open_then_extend_only_adds_new_couriers() {
        let book = OfferBook::new();
        let first = book.open_or_extend("o1", &ids(&["r1", "r2"]), WINDOW);
        assert!(first.new_round);
        assert_eq!(first.retry_count, 0);
        assert_eq!(first.candidates, 2);

        let second = book.open_or_extend("o1", &ids(&["r2", "r3"]), WINDOW);
        assert!(!second.new_round);
        assert_eq!(second.added, ids(&["r3"]));
        assert_eq!(second.expires_at, first.expires_at);
    }

    #[test]
    fn test_rejected_courier_is_not_reoffered_in_round() {
        let book = OfferBook::new();
        book.open_or_extend("o1", &ids(&["r1", "r2"]), WINDOW);

        assert_eq!(book.reject("o1", "r1"), Rejection::Removed { remaining: 1 });
        assert_eq!(book.reject("o1", "r1"), Rejection::NotCandidate);
        assert!(book.has_rejected("o1", "r1"));

        let update = book.open_or_extend("o1", &ids(&["r1"]), WINDOW);
        assert!(update.added.is_empty());
        assert!(!book.get("o1").unwrap().candidates.contains("r1"));

        assert_eq!(book.reject("o1", "r2"), Rejection::Removed { remaining: 0 });
        assert_eq!(book.reject("o2", "r2"), Rejection::NoOffer);
    }

    #[test]
    fn test_new_round_after_retire_clears_rejections() {
        let book = OfferBook::new();
        book.open_or_extend("o1", &ids(&["r1"]), WINDOW);
        book.reject("o1", "r1");
        let retired = book.retire("o1").unwrap();
        assert_eq!(retired.round(), 1);

        let next = book.open_or_extend("o1", &ids(&["r1"]), WINDOW);
        assert!(next.new_round);
        assert_eq!(next.retry_count, 1);
        assert_eq!(next.added, ids(&["r1"]));
        assert!(!book.has_rejected("o1", "r1"));
        assert_eq!(book.rounds("o1"), 2);

        book.finish("o1");
        assert_eq!(book.rounds("o1"), 0);
        assert_eq!(book.live_count(), 0);
    }
}
