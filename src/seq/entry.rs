//! Entry and payload types shared by the primary, backend, and retry queues.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ids::{OrderId, ParentInfo, Priority, Timestamp};

/// An order waiting in the primary or scheduled sub-queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryEvent {
    pub order_id: OrderId,
    pub priority: Priority,
    pub parent_info: Option<ParentInfo>,
}

/// Per-step-index payload carried by an async backend entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncStepData {
    /// Required, non-empty.
    pub queue_key: String,
    pub data: Option<serde_json::Value>,
    pub corrected: bool,
}

/// Completion status of a subworkflow backend entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubWorkflowStatus {
    Complete,
    Error,
}

/// The type-specific payload of a backend queue entry.
///
/// Event and SubWorkflow fold step indices into a set; Async folds into a
/// map and discards the new payload on a duplicate step index (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackendPayload {
    Event {
        steps: BTreeSet<i32>,
    },
    Async {
        steps: BTreeMap<i32, AsyncStepData>,
    },
    SubWorkflow {
        steps: BTreeSet<i32>,
        status: SubWorkflowStatus,
        child_order_id: OrderId,
    },
}

/// One entry resident in a [`crate::seq::backend::BackendQueue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEntry {
    pub order_id: OrderId,
    pub priority: Priority,
    pub parent_info: Option<ParentInfo>,
    pub modification_time: Timestamp,
    pub payload: BackendPayload,
}

/// An order awaiting a future retry, in one of the three retry queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub order_id: OrderId,
    /// For dynamic/async-retry queues this is a modification time (a delay
    /// is added at dequeue); for the fixed queue this is an absolute
    /// trigger time.
    pub mod_or_trigger_time: Timestamp,
    pub parent_info: Option<ParentInfo>,
}
