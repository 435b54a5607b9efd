//! OrderExpiryCache: a per-class FIFO of order submission times used to
//! compute SLA-breach counts, per spec §4.5.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

use crate::ids::{ClassId, OrderId, Timestamp};

/// Fallback SLA applied to a class with no entry (or a zero entry) in the
/// caller-supplied SLA map.
const DEFAULT_SLA_SECONDS: i64 = 1800;

/// Tolerated back-shift for an out-of-order `queue_order` submission.
const BACK_SHIFT_TOLERANCE: i64 = 30;

struct OecState {
    classes: HashMap<ClassId, VecDeque<(OrderId, Timestamp)>>,
}

pub struct OrderExpiryCache {
    state: Mutex<OecState>,
}

impl Default for OrderExpiryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderExpiryCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OecState { classes: HashMap::new() }),
        }
    }

    /// Appends an order to `class_id`'s deque. Entries are assumed to
    /// arrive roughly chronologically; a caller submitting more than
    /// [`BACK_SHIFT_TOLERANCE`] seconds behind the class's tail trips a
    /// debug assertion rather than corrupting ordering silently.
    pub fn queue_order(&self, class_id: ClassId, order_id: OrderId, created: Timestamp) {
        let mut state = self.state.lock();
        let deque = state.classes.entry(class_id).or_default();
        if let Some(&(_, last)) = deque.back() {
            debug_assert!(
                created >= last - BACK_SHIFT_TOLERANCE,
                "OrderExpiryCache::queue_order: {created} is more than {BACK_SHIFT_TOLERANCE}s behind tail {last}"
            );
        }
        deque.push_back((order_id, created));
    }

    /// Consumes, for each class, the longest chronological prefix whose age
    /// has reached `sla + delay`, where `sla` comes from `sla_seconds`
    /// (falling back to [`DEFAULT_SLA_SECONDS`] when absent or zero).
    /// Returns the number of breached orders per class; classes drained to
    /// empty are erased.
    pub fn get_events(&self, sla_seconds: Option<&HashMap<ClassId, i64>>, delay: i64, now: Timestamp) -> HashMap<ClassId, u64> {
        let mut state = self.state.lock();
        let mut result = HashMap::new();
        let mut drained = Vec::new();

        for (class_id, deque) in state.classes.iter_mut() {
            let sla = sla_seconds
                .and_then(|m| m.get(class_id).copied())
                .filter(|&s| s != 0)
                .unwrap_or(DEFAULT_SLA_SECONDS);

            let mut count = 0u64;
            while let Some(&(_, created)) = deque.front() {
                if now - created >= sla + delay {
                    deque.pop_front();
                    count += 1;
                } else {
                    break;
                }
            }
            if count > 0 {
                result.insert(*class_id, count);
            }
            if deque.is_empty() {
                drained.push(*class_id);
            }
        }

        for class_id in drained {
            state.classes.remove(&class_id);
        }
        result
    }

    /// Linear scan within `class_id`'s deque; removes the first matching order.
    pub fn remove_order(&self, class_id: ClassId, order_id: OrderId) -> bool {
        let mut state = self.state.lock();
        let Some(deque) = state.classes.get_mut(&class_id) else {
            return false;
        };
        let Some(pos) = deque.iter().position(|&(o, _)| o == order_id) else {
            return false;
        };
        deque.remove(pos);
        if deque.is_empty() {
            state.classes.remove(&class_id);
        }
        true
    }

    pub fn get_summary(&self) -> Vec<OecClassSummary> {
        self.state
            .lock()
            .classes
            .iter()
            .map(|(class_id, deque)| OecClassSummary {
                class_id: *class_id,
                count: deque.len(),
            })
            .collect()
    }

    pub fn get_details(&self) -> Vec<OecOrderDetail> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for (class_id, deque) in state.classes.iter() {
            for &(order_id, created) in deque {
                out.push(OecOrderDetail {
                    class_id: *class_id,
                    order_id,
                    created,
                });
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OecClassSummary {
    pub class_id: ClassId,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OecOrderDetail {
    pub class_id: ClassId,
    pub order_id: OrderId,
    pub created: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sla_breach() {
        let oec = OrderExpiryCache::new();
        oec.queue_order(ClassId(1), OrderId(1), 0);
        oec.queue_order(ClassId(1), OrderId(2), 100);

        // before SLA elapses: nothing
        let events = oec.get_events(None, 0, 1000);
        assert!(events.is_empty());

        // now - created = 1900 >= 1800 for order 1 only
        let events = oec.get_events(None, 0, 1900);
        assert_eq!(events.get(&ClassId(1)), Some(&1));
        assert_eq!(oec.get_summary()[0].count, 1);
    }

    #[test]
    fn custom_sla_and_delay() {
        let oec = OrderExpiryCache::new();
        oec.queue_order(ClassId(2), OrderId(5), 0);
        let mut sla = HashMap::new();
        sla.insert(ClassId(2), 60);
        let events = oec.get_events(Some(&sla), 10, 65);
        assert!(events.is_empty());
        let events = oec.get_events(Some(&sla), 10, 70);
        assert_eq!(events.get(&ClassId(2)), Some(&1));
    }

    #[test]
    fn zero_sla_falls_back_to_default() {
        let oec = OrderExpiryCache::new();
        oec.queue_order(ClassId(3), OrderId(9), 0);
        let mut sla = HashMap::new();
        sla.insert(ClassId(3), 0);
        let events = oec.get_events(Some(&sla), 0, 1800);
        assert_eq!(events.get(&ClassId(3)), Some(&1));
    }

    #[test]
    fn remove_order_erases_empty_class() {
        let oec = OrderExpiryCache::new();
        oec.queue_order(ClassId(1), OrderId(1), 0);
        assert!(oec.remove_order(ClassId(1), OrderId(1)));
        assert!(!oec.remove_order(ClassId(1), OrderId(1)));
        assert!(oec.get_summary().is_empty());
    }
}
