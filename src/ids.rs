//! Shared identifier and timestamp types used across the queue and caches.

use serde::{Deserialize, Serialize};

/// Workflow order instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(pub i64);

/// Workflow type / class id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassId(pub i64);

/// Synchronization event class key (string-keyed, used by the sync-event TDC).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncClassId(pub String);

/// Connection (integration, e.g. qorus "connection") id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

/// Backend segment id: one per registered backend queue (event/async/subworkflow).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub i32);

/// Dispatch priority. Lower value means higher precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub i32);

/// Seconds-since-epoch UTC timestamp, as used throughout the queue and caches.
pub type Timestamp = i64;

/// Returns the current time as seconds since the Unix epoch.
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp()
}

/// Identifies the parent order of a subworkflow step, if any.
///
/// A `None` here corresponds to the original's convention of a zero
/// `parent_order_id` meaning "no parent".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentInfo {
    pub parent_order_id: OrderId,
    pub parent_step_id: i32,
    pub parent_step_index: i32,
    pub is_subworkflow: bool,
}

impl ParentInfo {
    pub fn for_order(parent_order_id: i64, parent_step_id: i32, parent_step_index: i32, is_subworkflow: bool) -> Option<Self> {
        if parent_order_id == 0 {
            return None;
        }
        Some(Self {
            parent_order_id: OrderId(parent_order_id),
            parent_step_id,
            parent_step_index,
            is_subworkflow,
        })
    }
}
