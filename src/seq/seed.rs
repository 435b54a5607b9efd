//! Seed-state record shapes for the external persistence-snapshot
//! interface (spec §6). These are plain, serde-derived data records; the
//! caller is responsible for loading them from wherever the durable
//! snapshot actually lives (out of scope for this core, per §1).

use serde::{Deserialize, Serialize};

use crate::ids::{OrderId, ParentInfo, Priority, Timestamp};
use crate::seq::entry::SubWorkflowStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedPrimaryEvent {
    pub order_id: OrderId,
    pub priority: Priority,
    pub parent_info: Option<ParentInfo>,
    pub scheduled: Option<Timestamp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedRetryEvent {
    pub order_id: OrderId,
    pub modified: Timestamp,
    pub parent_info: Option<ParentInfo>,
    /// Presence routes this entry to the fixed retry queue instead of the
    /// dynamic one it would otherwise seed.
    pub retry_trigger: Option<Timestamp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedEventEntry {
    pub order_id: OrderId,
    pub ind: i32,
    pub priority: Priority,
    pub modified: Timestamp,
    pub parent_info: Option<ParentInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedAsyncEntry {
    pub order_id: OrderId,
    pub ind: i32,
    pub priority: Priority,
    pub modified: Timestamp,
    pub parent_info: Option<ParentInfo>,
    pub queuekey: String,
    pub corrected: bool,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedSubWorkflowEntry {
    pub order_id: OrderId,
    pub ind: i32,
    pub priority: Priority,
    pub modified: Timestamp,
    pub parent_info: Option<ParentInfo>,
    pub subworkflow_instanceid: OrderId,
    pub corrected: bool,
    /// `'C'` or `'E'`; ignored (forced to Complete) when `corrected` is true.
    pub status: char,
}

impl SeedSubWorkflowEntry {
    pub fn resolved_status(&self) -> SubWorkflowStatus {
        if self.corrected || self.status == 'C' {
            SubWorkflowStatus::Complete
        } else {
            SubWorkflowStatus::Error
        }
    }
}
