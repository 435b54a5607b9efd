//! PrimaryQueue: priority-bucketed ready queue plus a trigger-time-ordered
//! scheduled sub-queue, per spec §4.2.
//!
//! This type holds no lock of its own: it is manipulated entirely while the
//! owning [`crate::seq::SegmentEventQueue`]'s single mutex is held, and
//! reports back whether the caller should signal the primary condition
//! variable (first ready event, or a change to the earliest scheduled
//! trigger) rather than signaling itself.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::ids::{OrderId, ParentInfo, Priority, Timestamp};
use crate::seq::entry::PrimaryEvent;

#[derive(Debug, Default)]
pub struct PrimaryQueue {
    /// Ready orders, bucketed by priority, FIFO within a bucket.
    ready: BTreeMap<Priority, VecDeque<PrimaryEvent>>,
    /// Reverse index: order id -> its current priority bucket, iff ready.
    pmap: HashMap<OrderId, Priority>,
    /// Scheduled orders, ordered by (trigger time, insertion sequence).
    scheduled: BTreeMap<(Timestamp, u64), PrimaryEvent>,
    /// Reverse index: order id -> its scheduled key, iff scheduled.
    psmap: HashMap<OrderId, (Timestamp, u64)>,
    seq_counter: u64,
}

/// Whether the caller should wake waiters after a mutating call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    None,
    Signal,
}

impl PrimaryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn contains(&self, order_id: OrderId) -> bool {
        self.pmap.contains_key(&order_id) || self.psmap.contains_key(&order_id)
    }

    /// Adds an order to the ready queue, or the scheduled sub-queue if
    /// `scheduled` is a future timestamp. A no-op if the order is already
    /// resident (PQ-1: never in both at once, and never duplicated).
    pub fn add(
        &mut self,
        order_id: OrderId,
        priority: Priority,
        parent_info: Option<ParentInfo>,
        scheduled: Option<Timestamp>,
        now: Timestamp,
    ) -> Wake {
        if self.contains(order_id) {
            return Wake::None;
        }

        let event = PrimaryEvent {
            order_id,
            priority,
            parent_info,
        };

        match scheduled {
            Some(trigger) if trigger > now => {
                let was_empty = self.scheduled.is_empty();
                let first_trigger_before = self.scheduled.keys().next().map(|(t, _)| *t);
                let key = (trigger, self.seq_counter);
                self.seq_counter += 1;
                self.scheduled.insert(key, event);
                self.psmap.insert(order_id, key);
                if was_empty || first_trigger_before.is_some_and(|t| trigger < t) {
                    Wake::Signal
                } else {
                    Wake::None
                }
            }
            _ => {
                let was_empty = self.ready.is_empty();
                self.ready.entry(priority).or_default().push_back(event);
                self.pmap.insert(order_id, priority);
                if was_empty {
                    Wake::Signal
                } else {
                    Wake::None
                }
            }
        }
    }

    /// Moves every scheduled entry with `trigger <= now` into the ready
    /// queue, in trigger order. Returns `Wake::Signal` iff any entry moved
    /// into a previously-empty ready queue.
    pub fn check_event(&mut self, now: Timestamp) -> Wake {
        let mut moved_any = false;
        let was_ready_empty = self.ready.is_empty();

        loop {
            let Some((&key, _)) = self.scheduled.iter().next() else {
                break;
            };
            if key.0 > now {
                break;
            }
            let event = self.scheduled.remove(&key).unwrap();
            self.psmap.remove(&event.order_id);
            self.pmap.insert(event.order_id, event.priority);
            self.ready.entry(event.priority).or_default().push_back(event);
            moved_any = true;
        }

        if moved_any && was_ready_empty {
            Wake::Signal
        } else {
            Wake::None
        }
    }

    /// Removes and returns the front of the lowest-priority-numbered
    /// non-empty bucket.
    pub fn get_event(&mut self) -> Option<PrimaryEvent> {
        let &priority = self.ready.keys().next()?;
        let bucket = self.ready.get_mut(&priority).unwrap();
        let event = bucket.pop_front();
        if bucket.is_empty() {
            self.ready.remove(&priority);
        }
        if let Some(ref e) = event {
            self.pmap.remove(&e.order_id);
        }
        event
    }

    pub fn is_ready_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// The earliest scheduled trigger time, if any entries are scheduled.
    pub fn earliest_scheduled_trigger(&self) -> Option<Timestamp> {
        self.scheduled.keys().next().map(|(t, _)| *t)
    }

    /// Moves a resident order between the ready and scheduled queues.
    /// Fails silently (returns false) if the order is not resident.
    pub fn resched(&mut self, order_id: OrderId, scheduled: Option<Timestamp>, now: Timestamp) -> (bool, Wake) {
        let event = if let Some(&p) = self.pmap.get(&order_id) {
            self.remove_from_ready(order_id, p)
        } else if let Some(&key) = self.psmap.get(&order_id) {
            self.psmap.remove(&order_id);
            self.scheduled.remove(&key)
        } else {
            None
        };
        let Some(event) = event else {
            return (false, Wake::None);
        };

        let wake = self.add(order_id, event.priority, event.parent_info, scheduled, now);
        (true, wake)
    }

    fn remove_from_ready(&mut self, order_id: OrderId, priority: Priority) -> Option<PrimaryEvent> {
        self.pmap.remove(&order_id);
        let bucket = self.ready.get_mut(&priority)?;
        let idx = bucket.iter().position(|e| e.order_id == order_id)?;
        let event = bucket.remove(idx);
        if bucket.is_empty() {
            self.ready.remove(&priority);
        }
        event
    }

    /// Changes priority of a resident order in the ready queue, or updates
    /// the recorded priority of a scheduled one. Returns true iff found.
    pub fn reprioritize(&mut self, order_id: OrderId, priority: Priority) -> bool {
        if let Some(&old) = self.pmap.get(&order_id) {
            if old == priority {
                return true;
            }
            if let Some(mut event) = self.remove_from_ready(order_id, old) {
                event.priority = priority;
                self.ready.entry(priority).or_default().push_back(event);
                self.pmap.insert(order_id, priority);
            }
            return true;
        }
        if let Some(&key) = self.psmap.get(&order_id) {
            if let Some(mut event) = self.scheduled.remove(&key) {
                event.priority = priority;
                self.scheduled.insert(key, event);
            }
            return true;
        }
        false
    }

    /// Removes a resident order from whichever queue holds it.
    pub fn remove_workflow_order(&mut self, order_id: OrderId) -> bool {
        if let Some(&priority) = self.pmap.get(&order_id) {
            self.remove_from_ready(order_id, priority);
            return true;
        }
        if let Some(&key) = self.psmap.get(&order_id) {
            self.scheduled.remove(&key);
            self.psmap.remove(&order_id);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pe(order: i64) -> (OrderId, Priority) {
        (OrderId(order), Priority(5))
    }

    #[test]
    fn priority_ordering_scenario_a() {
        let mut pq = PrimaryQueue::new();
        pq.add(OrderId(100), Priority(5), None, None, 0);
        pq.add(OrderId(101), Priority(2), None, None, 0);
        pq.add(OrderId(102), Priority(5), None, None, 0);

        assert_eq!(pq.get_event().unwrap().order_id, OrderId(101));
        assert_eq!(pq.get_event().unwrap().order_id, OrderId(100));
        assert_eq!(pq.get_event().unwrap().order_id, OrderId(102));
        assert!(pq.get_event().is_none());
    }

    #[test]
    fn scheduled_event_moves_at_trigger() {
        let mut pq = PrimaryQueue::new();
        pq.add(OrderId(200), Priority(3), None, Some(1005), 1000);
        assert!(pq.get_event().is_none());
        assert_eq!(pq.earliest_scheduled_trigger(), Some(1005));

        pq.add(OrderId(201), Priority(3), None, None, 1003);
        assert_eq!(pq.get_event().unwrap().order_id, OrderId(201));

        pq.check_event(1006);
        assert_eq!(pq.get_event().unwrap().order_id, OrderId(200));
    }

    #[test]
    fn duplicate_add_is_noop() {
        let mut pq = PrimaryQueue::new();
        let (o, p) = pe(1);
        pq.add(o, p, None, None, 0);
        pq.add(o, p, None, None, 0);
        assert!(pq.get_event().is_some());
        assert!(pq.get_event().is_none());
    }

    #[test]
    fn reprioritize_moves_bucket() {
        let mut pq = PrimaryQueue::new();
        pq.add(OrderId(1), Priority(5), None, None, 0);
        assert!(pq.reprioritize(OrderId(1), Priority(1)));
        // re-running with the same priority is a no-op beyond the return value
        assert!(pq.reprioritize(OrderId(1), Priority(1)));
        let e = pq.get_event().unwrap();
        assert_eq!(e.priority, Priority(1));
    }

    #[test]
    fn remove_workflow_order_from_ready_and_scheduled() {
        let mut pq = PrimaryQueue::new();
        pq.add(OrderId(1), Priority(1), None, None, 0);
        assert!(pq.remove_workflow_order(OrderId(1)));
        assert!(pq.get_event().is_none());

        pq.add(OrderId(2), Priority(1), None, Some(500), 0);
        assert!(pq.remove_workflow_order(OrderId(2)));
        assert_eq!(pq.earliest_scheduled_trigger(), None);

        assert!(!pq.remove_workflow_order(OrderId(999)));
    }
}
