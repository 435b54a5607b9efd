//! SegmentEventQueue: the composition root of the dispatch core, per spec
//! §4.1. One coarse mutex protects every sub-structure (primary queue, all
//! retry queues, every backend queue, the exclusion map, and the
//! termination sets); a handful of condition variables sit beside it, one
//! per backend segment plus one for the primary queue and one shared by
//! all three retry queues (`retry_cond`), matching the locking discipline
//! of spec §5.

pub mod backend;
pub mod entry;
pub mod primary;
pub mod retry;
pub mod seed;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, instrument, warn};

use crate::config::{SystemOptionsSource, WorkflowParamsSource};
use crate::ids::{now, ConnectionId, OrderId, ParentInfo, Priority, SegmentId, Timestamp};

use backend::BackendQueue;
use entry::{BackendEntry, PrimaryEvent, RetryEntry};
use primary::{PrimaryQueue, Wake};
use retry::RetryQueue;
use seed::{SeedAsyncEntry, SeedEventEntry, SeedPrimaryEvent, SeedRetryEvent, SeedSubWorkflowEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Event,
    Async,
    SubWorkflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetrySource {
    Fixed,
    Dynamic,
    Async,
}

/// Outcome of [`SegmentEventQueue::grab_segment_inc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The exclusion counter was incremented; the caller now owns the claim.
    Claimed,
    /// A retry is in progress for this order; treat it as already claimed.
    AlreadyClaimed,
}

struct SeqState {
    primary: PrimaryQueue,
    backend_queues: HashMap<SegmentId, BackendQueue>,
    segment_kinds: HashMap<SegmentId, SegmentKind>,
    retry_dynamic: RetryQueue,
    retry_async: RetryQueue,
    retry_fixed: RetryQueue,
    /// Positive = executing count; `-1` = retry in progress; absent = idle.
    workflow_seg_map: HashMap<OrderId, i32>,
    conn_set: HashSet<ConnectionId>,
    retry_conn_set: HashSet<ConnectionId>,
    term: bool,
}

impl SeqState {
    fn new() -> Self {
        Self {
            primary: PrimaryQueue::new(),
            backend_queues: HashMap::new(),
            segment_kinds: HashMap::new(),
            retry_dynamic: RetryQueue::new(),
            retry_async: RetryQueue::new(),
            retry_fixed: RetryQueue::new(),
            workflow_seg_map: HashMap::new(),
            conn_set: HashSet::new(),
            retry_conn_set: HashSet::new(),
            term: false,
        }
    }
}

fn is_order_claimable(seg_map: &HashMap<OrderId, i32>, order_id: OrderId) -> bool {
    seg_map.get(&order_id).copied().unwrap_or(0) == 0
}

/// First positive value in tier order, 0 if every tier is absent or `<= 0`.
fn first_positive<const N: usize>(tiers: [Option<i64>; N]) -> i64 {
    tiers.into_iter().flatten().find(|v| *v > 0).unwrap_or(0)
}

pub struct SegmentEventQueue {
    state: Mutex<SeqState>,
    primary_cond: Condvar,
    retry_cond: Condvar,
    backend_conds: HashMap<SegmentId, Condvar>,
    workflow_params: Arc<dyn WorkflowParamsSource>,
    system_options: Arc<dyn SystemOptionsSource>,
}

impl SegmentEventQueue {
    pub fn new(workflow_params: Arc<dyn WorkflowParamsSource>, system_options: Arc<dyn SystemOptionsSource>) -> Self {
        Self {
            state: Mutex::new(SeqState::new()),
            primary_cond: Condvar::new(),
            retry_cond: Condvar::new(),
            backend_conds: HashMap::new(),
            workflow_params,
            system_options,
        }
    }

    // ---- Initialization (single-threaded; &mut self) -------------------

    fn add_segment(&mut self, segid: SegmentId, kind: SegmentKind) {
        let state = self.state.get_mut();
        debug_assert!(!state.segment_kinds.contains_key(&segid), "duplicate segment registration: {segid:?}");
        state.segment_kinds.insert(segid, kind);
        state.backend_queues.insert(segid, BackendQueue::new());
        self.backend_conds.insert(segid, Condvar::new());
    }

    pub fn add_event_segment(&mut self, segid: SegmentId) {
        self.add_segment(segid, SegmentKind::Event);
    }

    pub fn add_async_segment(&mut self, segid: SegmentId) {
        self.add_segment(segid, SegmentKind::Async);
    }

    pub fn add_subworkflow_segment(&mut self, segid: SegmentId) {
        self.add_segment(segid, SegmentKind::SubWorkflow);
    }

    pub fn init_primary_queue(&mut self, events: Vec<SeedPrimaryEvent>) {
        let now = now();
        let state = self.state.get_mut();
        for e in events {
            state.primary.add(e.order_id, e.priority, e.parent_info, e.scheduled, now);
        }
    }

    fn init_retry_into(state: &mut SeqState, events: Vec<SeedRetryEvent>, dynamic: impl Fn(&mut SeqState) -> &mut RetryQueue, fixed: impl Fn(&mut SeqState) -> &mut RetryQueue) {
        for e in events {
            let entry = RetryEntry {
                order_id: e.order_id,
                mod_or_trigger_time: e.retry_trigger.unwrap_or(e.modified),
                parent_info: e.parent_info,
            };
            if e.retry_trigger.is_some() {
                fixed(&mut *state).add(entry);
            } else {
                dynamic(&mut *state).add(entry);
            }
        }
    }

    pub fn init_retry_queue(&mut self, events: Vec<SeedRetryEvent>) {
        let state = self.state.get_mut();
        Self::init_retry_into(state, events, |s| &mut s.retry_dynamic, |s| &mut s.retry_fixed);
    }

    pub fn init_async_retry_queue(&mut self, events: Vec<SeedRetryEvent>) {
        let state = self.state.get_mut();
        Self::init_retry_into(state, events, |s| &mut s.retry_async, |s| &mut s.retry_fixed);
    }

    pub fn init_event_queue(&mut self, segid: SegmentId, events: Vec<SeedEventEntry>) {
        let state = self.state.get_mut();
        let queue = state.backend_queues.get_mut(&segid).expect("unknown segid");
        for e in events {
            queue.add_event(e.order_id, e.priority, e.parent_info, e.modified, e.ind);
        }
    }

    pub fn init_async_queue(&mut self, segid: SegmentId, events: Vec<SeedAsyncEntry>) {
        let state = self.state.get_mut();
        let queue = state.backend_queues.get_mut(&segid).expect("unknown segid");
        for e in events {
            queue.add_async(e.order_id, e.priority, e.parent_info, e.modified, e.ind, e.queuekey, e.data, e.corrected);
        }
    }

    pub fn init_subworkflow_queue(&mut self, segid: SegmentId, events: Vec<SeedSubWorkflowEntry>) {
        let state = self.state.get_mut();
        let queue = state.backend_queues.get_mut(&segid).expect("unknown segid");
        for e in events {
            let status = e.resolved_status();
            let child = e.subworkflow_instanceid;
            queue.add_subworkflow(e.order_id, e.priority, e.parent_info, e.modified, e.ind, status, child);
        }
    }

    // ---- Configuration resolution ---------------------------------------

    /// Dynamic retry delay, resolved fresh on every wait iteration:
    /// per-connection override, then the global workflow-param default,
    /// then the system option, first positive value wins (§4.1). The
    /// per-workflow-type tier is not reachable from here — `RetryEntry`
    /// (spec §3) carries no `class_id` — so `workflow_type_retry` stays
    /// unused by this queue; see DESIGN.md.
    fn resolve_retry_delay(&self, conn_id: ConnectionId) -> i64 {
        first_positive([
            self.workflow_params.connection_retry(conn_id.0),
            self.workflow_params.top_level_retry(),
            self.system_options.get_i64("recover_delay"),
        ])
    }

    fn resolve_async_delay(&self, conn_id: ConnectionId) -> i64 {
        first_positive([
            self.workflow_params.connection_async(conn_id.0),
            self.workflow_params.top_level_async(),
            self.system_options.get_i64("async_delay"),
        ])
    }

    fn notify_backend(&self, segid: SegmentId) {
        if let Some(cond) = self.backend_conds.get(&segid) {
            cond.notify_all();
        }
    }

    fn notify_all_backends(&self) {
        for cond in self.backend_conds.values() {
            cond.notify_all();
        }
    }

    // ---- Steady-state submission -----------------------------------------

    pub fn queue_primary_event(&self, order_id: OrderId, priority: Priority, parent_info: Option<ParentInfo>, scheduled: Option<Timestamp>) {
        let mut state = self.state.lock();
        let now = now();
        if state.primary.add(order_id, priority, parent_info, scheduled, now) == Wake::Signal {
            self.primary_cond.notify_all();
        }
    }

    pub fn queue_workflow_event(&self, segid: SegmentId, order_id: OrderId, priority: Priority, parent_info: Option<ParentInfo>, step_index: i32) {
        let now = now();
        {
            let mut state = self.state.lock();
            let queue = state.backend_queues.get_mut(&segid).expect("unknown segid");
            queue.add_event(order_id, priority, parent_info, now, step_index);
        }
        self.notify_backend(segid);
    }

    pub fn queue_async_event(
        &self,
        segid: SegmentId,
        order_id: OrderId,
        priority: Priority,
        parent_info: Option<ParentInfo>,
        step_index: i32,
        queue_key: String,
        data: Option<serde_json::Value>,
        corrected: bool,
    ) {
        let now = now();
        {
            let mut state = self.state.lock();
            let queue = state.backend_queues.get_mut(&segid).expect("unknown segid");
            queue.add_async(order_id, priority, parent_info, now, step_index, queue_key, data, corrected);
        }
        self.notify_backend(segid);
    }

    pub fn queue_subworkflow_event(
        &self,
        segid: SegmentId,
        order_id: OrderId,
        priority: Priority,
        parent_info: Option<ParentInfo>,
        step_index: i32,
        status: entry::SubWorkflowStatus,
        child_order_id: OrderId,
    ) {
        let now = now();
        {
            let mut state = self.state.lock();
            let queue = state.backend_queues.get_mut(&segid).expect("unknown segid");
            queue.add_subworkflow(order_id, priority, parent_info, now, step_index, status, child_order_id);
        }
        self.notify_backend(segid);
    }

    pub fn queue_retry_event(&self, order_id: OrderId, date: Timestamp, parent_info: Option<ParentInfo>) -> crate::error::RetryOutcome {
        let mut state = self.state.lock();
        let queued = state.retry_dynamic.add(RetryEntry {
            order_id,
            mod_or_trigger_time: date,
            parent_info,
        });
        if queued {
            self.retry_cond.notify_all();
            crate::error::RetryOutcome::Queued
        } else {
            crate::error::RetryOutcome::NotQueued
        }
    }

    pub fn queue_retry_event_fixed(&self, order_id: OrderId, trigger: Timestamp, parent_info: Option<ParentInfo>) -> crate::error::RetryOutcome {
        let mut state = self.state.lock();
        let queued = state.retry_fixed.add(RetryEntry {
            order_id,
            mod_or_trigger_time: trigger,
            parent_info,
        });
        if queued {
            self.retry_cond.notify_all();
            crate::error::RetryOutcome::Queued
        } else {
            crate::error::RetryOutcome::NotQueued
        }
    }

    pub fn queue_async_retry_event(&self, order_id: OrderId, date: Timestamp, parent_info: Option<ParentInfo>) -> crate::error::RetryOutcome {
        let mut state = self.state.lock();
        let queued = state.retry_async.add(RetryEntry {
            order_id,
            mod_or_trigger_time: date,
            parent_info,
        });
        if queued {
            self.retry_cond.notify_all();
            crate::error::RetryOutcome::Queued
        } else {
            crate::error::RetryOutcome::NotQueued
        }
    }

    pub fn resched_primary_event(&self, order_id: OrderId, date: Option<Timestamp>) -> bool {
        let mut state = self.state.lock();
        let now = now();
        let (found, wake) = state.primary.resched(order_id, date, now);
        if wake == Wake::Signal {
            self.primary_cond.notify_all();
        }
        found
    }

    pub fn reprioritize(&self, order_id: OrderId, priority: Priority) -> bool {
        let mut state = self.state.lock();
        let mut found = state.primary.reprioritize(order_id, priority);
        for queue in state.backend_queues.values_mut() {
            if queue.reprioritize(order_id, priority) {
                found = true;
            }
        }
        found
    }

    /// Erases `order_id` from primary/scheduled and from the `old_priority`
    /// bucket of every backend queue. Best-effort: the caller must know the
    /// order's current priority (§9 open question — preserved as-is).
    pub fn remove_workflow_order(&self, order_id: OrderId, old_priority: Priority) -> bool {
        let mut state = self.state.lock();
        let mut found = state.primary.remove_workflow_order(order_id);
        for queue in state.backend_queues.values_mut() {
            if queue.remove_workflow_order(order_id, old_priority) {
                found = true;
            }
        }
        found
    }

    pub fn remove_workflow_instance(&self, order_id: OrderId) -> bool {
        let mut state = self.state.lock();
        let a = state.retry_dynamic.remove_workflow_instance(order_id);
        let b = state.retry_async.remove_workflow_instance(order_id);
        let c = state.retry_fixed.remove_workflow_instance(order_id);
        a || b || c
    }

    pub fn requeue_retries(&self) {
        let mut state = self.state.lock();
        state.retry_dynamic.clear_markers();
        state.retry_async.clear_markers();
        state.retry_fixed.clear_markers();
        self.retry_cond.notify_all();
    }

    /// Absorbs `other`'s retry queues and backend queues into `self`.
    /// `other` must have the same segment set as `self`; unmatched
    /// segments on `other`'s side are left untouched (a programming
    /// error per §7's precondition-violation category).
    pub fn merge_all(&self, other: &SegmentEventQueue) {
        // Lock in a fixed address order to avoid deadlocking against a
        // concurrent merge_all(self) on the other instance.
        let self_addr = self as *const _ as usize;
        let other_addr = other as *const _ as usize;
        let (mut a, mut b) = if self_addr < other_addr {
            (self.state.lock(), other.state.lock())
        } else {
            let b = other.state.lock();
            let a = self.state.lock();
            (a, b)
        };

        a.retry_dynamic.merge(&mut b.retry_dynamic);
        a.retry_async.merge(&mut b.retry_async);
        a.retry_fixed.merge(&mut b.retry_fixed);

        for (segid, queue) in b.backend_queues.iter_mut() {
            if let Some(dest) = a.backend_queues.get_mut(segid) {
                dest.merge(queue);
            } else {
                warn!(?segid, "merge_all: source segment absent on destination, skipping");
            }
        }

        drop(a);
        drop(b);
        self.retry_cond.notify_all();
        self.notify_all_backends();
    }

    pub fn grab_segment_inc(&self, order_id: OrderId) -> ClaimOutcome {
        let mut state = self.state.lock();
        let count = state.workflow_seg_map.entry(order_id).or_insert(0);
        if *count == -1 {
            return ClaimOutcome::AlreadyClaimed;
        }
        *count += 1;
        ClaimOutcome::Claimed
    }

    pub fn release_segment(&self, order_id: OrderId) {
        let mut state = self.state.lock();
        let cleared = match state.workflow_seg_map.get_mut(&order_id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    state.workflow_seg_map.remove(&order_id);
                    true
                } else {
                    false
                }
            }
            _ => {
                debug_assert!(false, "release_segment: no execution in progress for {order_id:?}");
                false
            }
        };
        drop(state);
        if cleared {
            self.retry_cond.notify_all();
            self.notify_all_backends();
        }
    }

    pub fn release_retry_segment(&self, order_id: OrderId) {
        let mut state = self.state.lock();
        match state.workflow_seg_map.get(&order_id) {
            Some(-1) => {
                state.workflow_seg_map.remove(&order_id);
            }
            _ => debug_assert!(false, "release_retry_segment: no retry in progress for {order_id:?}"),
        }
        drop(state);
        self.notify_all_backends();
    }

    // ---- Consumption -------------------------------------------------------

    #[instrument(skip(self))]
    pub fn get_primary_event(&self, conn_id: ConnectionId) -> Option<PrimaryEvent> {
        let mut state = self.state.lock();
        loop {
            if state.term || state.conn_set.contains(&conn_id) {
                return None;
            }
            let now = now();
            state.primary.check_event(now);
            if let Some(event) = state.primary.get_event() {
                return Some(event);
            }
            match state.primary.earliest_scheduled_trigger() {
                Some(trigger) if trigger > now => {
                    let timeout = Duration::from_secs((trigger - now) as u64);
                    self.primary_cond.wait_for(&mut state, timeout);
                }
                _ => {
                    self.primary_cond.wait(&mut state);
                }
            }
        }
    }

    fn get_backend_event(&self, conn_id: ConnectionId, segid: SegmentId, expected_kind: SegmentKind) -> Option<BackendEntry> {
        let cond = self.backend_conds.get(&segid).expect("unknown segid");
        let mut state = self.state.lock();
        debug_assert_eq!(state.segment_kinds.get(&segid).copied(), Some(expected_kind));
        loop {
            if state.term || state.conn_set.contains(&conn_id) {
                return None;
            }
            let SeqState {
                workflow_seg_map,
                backend_queues,
                ..
            } = &mut *state;
            let found = backend_queues
                .get_mut(&segid)
                .expect("unknown segid")
                .take_event(|order_id| is_order_claimable(workflow_seg_map, order_id));
            if let Some(entry) = found {
                *state.workflow_seg_map.entry(entry.order_id).or_insert(0) += 1;
                return Some(entry);
            }
            cond.wait(&mut state);
        }
    }

    #[instrument(skip(self))]
    pub fn get_workflow_event(&self, conn_id: ConnectionId, segid: SegmentId) -> Option<BackendEntry> {
        self.get_backend_event(conn_id, segid, SegmentKind::Event)
    }

    #[instrument(skip(self))]
    pub fn get_async_event(&self, conn_id: ConnectionId, segid: SegmentId) -> Option<BackendEntry> {
        self.get_backend_event(conn_id, segid, SegmentKind::Async)
    }

    #[instrument(skip(self))]
    pub fn get_subworkflow_event(&self, conn_id: ConnectionId, segid: SegmentId) -> Option<BackendEntry> {
        self.get_backend_event(conn_id, segid, SegmentKind::SubWorkflow)
    }

    /// The complex case: dispatches across the fixed, dynamic-retry, and
    /// async-retry queues under the tie-break rule traced from the
    /// original `get_retry_event` (async beats dynamic beats fixed on an
    /// exact effective-trigger tie). See spec §4.1 and `SPEC_FULL.md` §1.2.
    ///
    /// Starvation note (§9 open question, preserved as-is): only the
    /// earliest eligible candidate per queue is considered per iteration;
    /// if that candidate stays marker-set-tagged indefinitely (another
    /// waiter keeps re-marking it), later candidates in the same queue are
    /// never reached.
    #[instrument(skip(self))]
    pub fn get_retry_event(&self, conn_id: ConnectionId) -> Option<RetryEntry> {
        let mut state = self.state.lock();
        loop {
            if state.term || state.conn_set.contains(&conn_id) {
                return None;
            }
            if state.retry_conn_set.remove(&conn_id) {
                return None;
            }

            let now = now();
            let recover_delay = self.resolve_retry_delay(conn_id);
            let async_delay = self.resolve_async_delay(conn_id);
            let seg_map = &state.workflow_seg_map;

            let fixed = state.retry_fixed.earliest_candidate(|o| is_order_claimable(seg_map, o)).cloned();
            let dynamic = state.retry_dynamic.earliest_candidate(|o| is_order_claimable(seg_map, o)).cloned();
            let asyncc = state.retry_async.earliest_candidate(|o| is_order_claimable(seg_map, o)).cloned();

            let mut winner: Option<(RetrySource, Timestamp, RetryEntry)> = None;
            for (source, candidate, delay) in [
                (RetrySource::Fixed, fixed, 0),
                (RetrySource::Dynamic, dynamic, recover_delay),
                (RetrySource::Async, asyncc, async_delay),
            ] {
                let Some(entry) = candidate else { continue };
                let trig = entry.mod_or_trigger_time + delay;
                let replace = match &winner {
                    None => true,
                    Some((_, wtrig, _)) => trig <= *wtrig,
                };
                if replace {
                    winner = Some((source, trig, entry));
                }
            }

            let Some((source, trig, entry)) = winner else {
                self.retry_cond.wait(&mut state);
                continue;
            };

            let diff = trig - now;
            if diff <= 0 {
                let order_id = entry.order_id;
                match source {
                    RetrySource::Fixed => {
                        state.retry_fixed.take(order_id);
                    }
                    RetrySource::Dynamic => {
                        state.retry_dynamic.take(order_id);
                    }
                    RetrySource::Async => {
                        state.retry_async.take(order_id);
                    }
                }
                state.workflow_seg_map.insert(order_id, -1);
                debug!(?order_id, ?source, "retry dispatched");
                return Some(entry);
            }

            match source {
                RetrySource::Fixed => state.retry_fixed.mark(entry.order_id),
                RetrySource::Dynamic => state.retry_dynamic.mark(entry.order_id),
                RetrySource::Async => state.retry_async.mark(entry.order_id),
            }
            let timeout = Duration::from_secs(diff as u64);
            self.retry_cond.wait_for(&mut state, timeout);
            match source {
                RetrySource::Fixed => state.retry_fixed.unmark(entry.order_id),
                RetrySource::Dynamic => state.retry_dynamic.unmark(entry.order_id),
                RetrySource::Async => state.retry_async.unmark(entry.order_id),
            }
        }
    }

    pub fn terminate_connection(&self, conn_id: ConnectionId) {
        let mut state = self.state.lock();
        state.conn_set.insert(conn_id);
        drop(state);
        self.primary_cond.notify_all();
        self.retry_cond.notify_all();
        self.notify_all_backends();
    }

    pub fn terminate_retry_connection(&self, conn_id: ConnectionId) {
        let mut state = self.state.lock();
        state.retry_conn_set.insert(conn_id);
        drop(state);
        self.retry_cond.notify_all();
    }

    pub fn cleanup_connection(&self, conn_id: ConnectionId) {
        let mut state = self.state.lock();
        state.conn_set.remove(&conn_id);
        state.retry_conn_set.remove(&conn_id);
    }

    /// Sets the termination flag and wakes every waiter; they observe
    /// `term` and return `NONE`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.term = true;
        drop(state);
        self.primary_cond.notify_all();
        self.retry_cond.notify_all();
        self.notify_all_backends();
    }

    /// Diagnostic summary; format is not a stable protocol (§6).
    pub fn summary(&self) -> String {
        let state = self.state.lock();
        format!(
            "SegmentEventQueue {{ segments: {}, retry(dynamic={}, async={}, fixed={}), executing_or_retrying: {} }}",
            state.backend_queues.len(),
            !state.retry_dynamic.is_empty(),
            !state.retry_async.is_empty(),
            !state.retry_fixed.is_empty(),
            state.workflow_seg_map.len(),
        )
    }
}
