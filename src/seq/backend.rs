//! BackendQueue family: per-segment priority-bucketed multimaps with
//! per-order folding, per spec §4.3.
//!
//! One `BackendQueue` instance backs a single segment and holds entries of
//! a single payload shape (event, async, or subworkflow) for the lifetime
//! of the segment — the payload shape of the first entry submitted to it is
//! not enforced here; callers (`SegmentEventQueue::queue_*_event`) only
//! ever submit one shape per segment, matching the `init_event_queue` /
//! `init_async_queue` / `init_subworkflow_queue` seeding split.

use std::collections::{BTreeMap, HashMap};

use crate::ids::{OrderId, ParentInfo, Priority, Timestamp};
use crate::seq::entry::{AsyncStepData, BackendEntry, BackendPayload, SubWorkflowStatus};

/// Within a priority bucket, entries order by `(modification_time,
/// insertion sequence)` — oldest modification time first, ties broken by
/// insertion order (§4.3), mirroring a `std::multimap<int64, ...>` keyed on
/// `mod`. Folding a step into an existing entry never re-keys it.
type BucketKey = (Timestamp, u64);

#[derive(Debug, Default)]
pub struct BackendQueue {
    entries: BTreeMap<Priority, BTreeMap<BucketKey, BackendEntry>>,
    /// Reverse index for Event/Async entries (single folding scope).
    wfmap: HashMap<OrderId, (Priority, BucketKey)>,
    /// Reverse index for SubWorkflow `COMPLETE` entries (separate scope).
    c_wfmap: HashMap<OrderId, (Priority, BucketKey)>,
    /// Reverse index for SubWorkflow `ERROR` entries (separate scope).
    e_wfmap: HashMap<OrderId, (Priority, BucketKey)>,
    seq_counter: u64,
}

fn reverse_map_for_payload<'a>(
    wfmap: &'a mut HashMap<OrderId, (Priority, BucketKey)>,
    c_wfmap: &'a mut HashMap<OrderId, (Priority, BucketKey)>,
    e_wfmap: &'a mut HashMap<OrderId, (Priority, BucketKey)>,
    payload: &BackendPayload,
) -> &'a mut HashMap<OrderId, (Priority, BucketKey)> {
    match payload {
        BackendPayload::Event { .. } | BackendPayload::Async { .. } => wfmap,
        BackendPayload::SubWorkflow {
            status: SubWorkflowStatus::Complete,
            ..
        } => c_wfmap,
        BackendPayload::SubWorkflow {
            status: SubWorkflowStatus::Error,
            ..
        } => e_wfmap,
    }
}

impl BackendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(BTreeMap::is_empty)
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq_counter;
        self.seq_counter += 1;
        seq
    }

    fn find_mut(&mut self, priority: Priority, key: BucketKey) -> Option<&mut BackendEntry> {
        self.entries.get_mut(&priority)?.get_mut(&key)
    }

    /// Folds a step index into an existing Event entry, or creates one.
    pub fn add_event(
        &mut self,
        order_id: OrderId,
        priority: Priority,
        parent_info: Option<ParentInfo>,
        modification_time: Timestamp,
        step_index: i32,
    ) {
        if let Some(&(priority, key)) = self.wfmap.get(&order_id) {
            if let Some(entry) = self.find_mut(priority, key) {
                if let BackendPayload::Event { steps } = &mut entry.payload {
                    steps.insert(step_index);
                    return;
                }
            }
        }
        let mut steps = std::collections::BTreeSet::new();
        steps.insert(step_index);
        let entry = BackendEntry {
            order_id,
            priority,
            parent_info,
            modification_time,
            payload: BackendPayload::Event { steps },
        };
        let key = (modification_time, self.next_seq());
        self.entries.entry(priority).or_default().insert(key, entry);
        self.wfmap.insert(order_id, (priority, key));
    }

    /// Folds a step index into an existing Async entry (discarding the new
    /// payload on a duplicate step index), or creates one.
    pub fn add_async(
        &mut self,
        order_id: OrderId,
        priority: Priority,
        parent_info: Option<ParentInfo>,
        modification_time: Timestamp,
        step_index: i32,
        queue_key: String,
        data: Option<serde_json::Value>,
        corrected: bool,
    ) {
        if let Some(&(priority, key)) = self.wfmap.get(&order_id) {
            if let Some(entry) = self.find_mut(priority, key) {
                if let BackendPayload::Async { steps } = &mut entry.payload {
                    steps.entry(step_index).or_insert(AsyncStepData {
                        queue_key,
                        data,
                        corrected,
                    });
                    return;
                }
            }
        }
        let mut steps = BTreeMap::new();
        steps.insert(
            step_index,
            AsyncStepData {
                queue_key,
                data,
                corrected,
            },
        );
        let entry = BackendEntry {
            order_id,
            priority,
            parent_info,
            modification_time,
            payload: BackendPayload::Async { steps },
        };
        let key = (modification_time, self.next_seq());
        self.entries.entry(priority).or_default().insert(key, entry);
        self.wfmap.insert(order_id, (priority, key));
    }

    /// Folds a step index into an existing SubWorkflow entry for the same
    /// status, or creates one. `COMPLETE` and `ERROR` are separate folding
    /// scopes (BE-1): an order may have at most one of each concurrently.
    pub fn add_subworkflow(
        &mut self,
        order_id: OrderId,
        priority: Priority,
        parent_info: Option<ParentInfo>,
        modification_time: Timestamp,
        step_index: i32,
        status: SubWorkflowStatus,
        child_order_id: OrderId,
    ) {
        let scope = match status {
            SubWorkflowStatus::Complete => &self.c_wfmap,
            SubWorkflowStatus::Error => &self.e_wfmap,
        };
        if let Some(&(priority, key)) = scope.get(&order_id) {
            if let Some(entry) = self.find_mut(priority, key) {
                if let BackendPayload::SubWorkflow { steps, .. } = &mut entry.payload {
                    steps.insert(step_index);
                    return;
                }
            }
        }
        let mut steps = std::collections::BTreeSet::new();
        steps.insert(step_index);
        let entry = BackendEntry {
            order_id,
            priority,
            parent_info,
            modification_time,
            payload: BackendPayload::SubWorkflow {
                steps,
                status,
                child_order_id,
            },
        };
        let key = (modification_time, self.next_seq());
        self.entries.entry(priority).or_default().insert(key, entry);
        match status {
            SubWorkflowStatus::Complete => self.c_wfmap.insert(order_id, (priority, key)),
            SubWorkflowStatus::Error => self.e_wfmap.insert(order_id, (priority, key)),
        };
    }

    /// Removes and returns the highest-precedence, oldest entry whose order
    /// is accepted by `is_claimable` (used by the SEQ to skip orders that
    /// are already executing or in retry).
    pub fn take_event(&mut self, mut is_claimable: impl FnMut(OrderId) -> bool) -> Option<BackendEntry> {
        let priorities: Vec<Priority> = self.entries.keys().copied().collect();
        for priority in priorities {
            let bucket = self.entries.get_mut(&priority)?;
            let hit = bucket.iter().find(|(_, e)| is_claimable(e.order_id)).map(|(&k, _)| k);
            if let Some(key) = hit {
                let entry = bucket.remove(&key).unwrap();
                if bucket.is_empty() {
                    self.entries.remove(&priority);
                }
                let scope = reverse_map_for_payload(&mut self.wfmap, &mut self.c_wfmap, &mut self.e_wfmap, &entry.payload);
                scope.remove(&entry.order_id);
                return Some(entry);
            }
        }
        None
    }

    /// Moves every entry for `order_id` to the `new_priority` bucket.
    /// Returns true iff at least one entry was found.
    pub fn reprioritize(&mut self, order_id: OrderId, new_priority: Priority) -> bool {
        let mut found = false;
        let candidates: Vec<(Priority, BucketKey)> = [&self.wfmap, &self.c_wfmap, &self.e_wfmap]
            .into_iter()
            .filter_map(|m| m.get(&order_id).copied())
            .collect();
        for (old_priority, old_key) in candidates {
            if old_priority == new_priority {
                found = true;
                continue;
            }
            if let Some(bucket) = self.entries.get_mut(&old_priority) {
                if let Some(mut entry) = bucket.remove(&old_key) {
                    if bucket.is_empty() {
                        self.entries.remove(&old_priority);
                    }
                    entry.priority = new_priority;
                    let new_key = (old_key.0, self.next_seq());
                    let target_scope = reverse_map_for_payload(&mut self.wfmap, &mut self.c_wfmap, &mut self.e_wfmap, &entry.payload);
                    target_scope.insert(order_id, (new_priority, new_key));
                    self.entries.entry(new_priority).or_default().insert(new_key, entry);
                    found = true;
                }
            }
        }
        found
    }

    /// Removes every entry for `order_id` in the `old_priority` bucket,
    /// across all folding scopes. Best-effort: callers must supply the
    /// priority the order was last known to occupy (§9 open question).
    pub fn remove_workflow_order(&mut self, order_id: OrderId, old_priority: Priority) -> bool {
        let mut found = false;
        if let Some(bucket) = self.entries.get_mut(&old_priority) {
            let before = bucket.len();
            bucket.retain(|_, e| e.order_id != order_id);
            found = bucket.len() != before;
            if bucket.is_empty() {
                self.entries.remove(&old_priority);
            }
        }
        self.wfmap.remove(&order_id);
        self.c_wfmap.remove(&order_id);
        self.e_wfmap.remove(&order_id);
        found
    }

    /// Absorbs every entry of `other` into `self`, preserving priority
    /// buckets; `other` is left empty.
    pub fn merge(&mut self, other: &mut BackendQueue) {
        for (priority, bucket) in std::mem::take(&mut other.entries) {
            let target = self.entries.entry(priority).or_default();
            for (_, entry) in bucket {
                let key = (entry.modification_time, self.seq_counter);
                self.seq_counter += 1;
                target.insert(key, entry);
            }
        }
        other.wfmap.clear();
        other.c_wfmap.clear();
        other.e_wfmap.clear();
        other.seq_counter = 0;
        self.rebuild_index();
    }

    fn rebuild_index(&mut self) {
        self.wfmap.clear();
        self.c_wfmap.clear();
        self.e_wfmap.clear();
        for (&priority, bucket) in &self.entries {
            for (&key, entry) in bucket {
                let scope = match &entry.payload {
                    BackendPayload::Event { .. } | BackendPayload::Async { .. } => &mut self.wfmap,
                    BackendPayload::SubWorkflow {
                        status: SubWorkflowStatus::Complete,
                        ..
                    } => &mut self.c_wfmap,
                    BackendPayload::SubWorkflow {
                        status: SubWorkflowStatus::Error,
                        ..
                    } => &mut self.e_wfmap,
                };
                scope.insert(entry.order_id, (priority, key));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn async_folding_and_duplicate_discard_scenario_c() {
        let mut q = BackendQueue::new();
        q.add_async(OrderId(300), Priority(1), None, 100, 1, "k1".into(), Some(serde_json::json!("X")), false);
        q.add_async(OrderId(300), Priority(1), None, 101, 2, "k2".into(), Some(serde_json::json!("Y")), false);
        // duplicate step index 1: discarded
        q.add_async(OrderId(300), Priority(1), None, 102, 1, "k1b".into(), Some(serde_json::json!("Z")), false);

        let entry = q.take_event(|_| true).unwrap();
        let BackendPayload::Async { steps } = entry.payload else {
            panic!("expected async payload");
        };
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[&1].queue_key, "k1");
        assert_eq!(steps[&2].queue_key, "k2");
        assert!(q.take_event(|_| true).is_none());
    }

    #[test]
    fn exclusion_skips_claimed_orders() {
        let mut q = BackendQueue::new();
        q.add_event(OrderId(1), Priority(1), None, 0, 1);
        q.add_event(OrderId(2), Priority(1), None, 1, 1);

        let skip_one = |id: OrderId| id != OrderId(1);
        let entry = q.take_event(skip_one).unwrap();
        assert_eq!(entry.order_id, OrderId(2));
    }

    #[test]
    fn subworkflow_complete_and_error_are_separate_scopes() {
        let mut q = BackendQueue::new();
        q.add_subworkflow(OrderId(1), Priority(1), None, 0, 1, SubWorkflowStatus::Complete, OrderId(10));
        q.add_subworkflow(OrderId(1), Priority(1), None, 0, 2, SubWorkflowStatus::Error, OrderId(11));

        let a = q.take_event(|_| true).unwrap();
        let b = q.take_event(|_| true).unwrap();
        assert_eq!(a.order_id, OrderId(1));
        assert_eq!(b.order_id, OrderId(1));
        assert!(q.take_event(|_| true).is_none());
    }

    #[test]
    fn merge_absorbs_other_queue() {
        let mut a = BackendQueue::new();
        let mut b = BackendQueue::new();
        a.add_event(OrderId(1), Priority(1), None, 0, 1);
        b.add_event(OrderId(2), Priority(1), None, 0, 1);

        a.merge(&mut b);
        assert!(b.is_empty());
        assert!(a.take_event(|_| true).is_some());
        assert!(a.take_event(|_| true).is_some());
    }

    #[test]
    fn out_of_order_modification_time_still_dispatches_oldest_first() {
        let mut q = BackendQueue::new();
        // inserted newest-mod-time first; dispatch must still honor mod-time order
        q.add_event(OrderId(1), Priority(1), None, 200, 1);
        q.add_event(OrderId(2), Priority(1), None, 100, 1);

        let first = q.take_event(|_| true).unwrap();
        assert_eq!(first.order_id, OrderId(2));
        let second = q.take_event(|_| true).unwrap();
        assert_eq!(second.order_id, OrderId(1));
    }

    #[test]
    fn reprioritize_preserves_modification_time_order_in_new_bucket() {
        let mut q = BackendQueue::new();
        q.add_event(OrderId(1), Priority(1), None, 50, 1);
        q.add_event(OrderId(2), Priority(2), None, 10, 1);

        // order 1 moves into priority 2's bucket; its older mod time (50 <
        // 10 is false, so it lands after order 2) must still govern position
        assert!(q.reprioritize(OrderId(1), Priority(2)));
        let first = q.take_event(|_| true).unwrap();
        assert_eq!(first.order_id, OrderId(2));
        let second = q.take_event(|_| true).unwrap();
        assert_eq!(second.order_id, OrderId(1));
    }
}
