//! External configuration seams.
//!
//! The queue and caches never hardcode retry delays, TTLs, or cache size
//! limits: they resolve them through these two traits on every wait
//! iteration, so a caller's dynamic option changes take effect without
//! restarting anything. Callers back these with whatever configuration
//! layer they already run; [`StaticSystemOptions`] and
//! [`StaticWorkflowParams`] are the in-memory defaults used by tests and by
//! callers with no dynamic layer of their own.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::ids::ClassId;

/// Resolves named, process-wide tunables (e.g. `"qorus-async-delay"`,
/// TDC/OEC delay and max-size option names).
pub trait SystemOptionsSource: Send + Sync {
    fn get_i64(&self, key: &str) -> Option<i64>;
}

/// Resolves workflow-type- and connection-scoped retry/async delays.
///
/// Lookup order, per connection and per workflow type, is caller-defined;
/// the queue consults connection-level overrides before workflow-type
/// defaults before the top-level fallback (see [`crate::seq`] docs).
pub trait WorkflowParamsSource: Send + Sync {
    fn connection_retry(&self, connection_id: u64) -> Option<i64>;
    fn connection_async(&self, connection_id: u64) -> Option<i64>;
    fn workflow_type_retry(&self, class_id: ClassId) -> Option<i64>;
    fn workflow_type_async(&self, class_id: ClassId) -> Option<i64>;
    fn top_level_retry(&self) -> Option<i64>;
    fn top_level_async(&self) -> Option<i64>;
}

/// A plain in-memory [`SystemOptionsSource`], settable at runtime.
#[derive(Debug, Default)]
pub struct StaticSystemOptions {
    values: RwLock<HashMap<String, i64>>,
}

impl StaticSystemOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: i64) {
        self.values.write().insert(key.into(), value);
    }
}

impl SystemOptionsSource for StaticSystemOptions {
    fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.read().get(key).copied()
    }
}

/// A plain in-memory [`WorkflowParamsSource`], settable at runtime.
#[derive(Debug, Default)]
pub struct StaticWorkflowParams {
    connection_retry: RwLock<HashMap<u64, i64>>,
    connection_async: RwLock<HashMap<u64, i64>>,
    workflow_retry: RwLock<HashMap<i64, i64>>,
    workflow_async: RwLock<HashMap<i64, i64>>,
    top_retry: RwLock<Option<i64>>,
    top_async: RwLock<Option<i64>>,
}

impl StaticWorkflowParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connection_retry(&self, connection_id: u64, delay: i64) {
        self.connection_retry.write().insert(connection_id, delay);
    }

    pub fn set_connection_async(&self, connection_id: u64, delay: i64) {
        self.connection_async.write().insert(connection_id, delay);
    }

    pub fn set_workflow_type_retry(&self, class_id: ClassId, delay: i64) {
        self.workflow_retry.write().insert(class_id.0, delay);
    }

    pub fn set_workflow_type_async(&self, class_id: ClassId, delay: i64) {
        self.workflow_async.write().insert(class_id.0, delay);
    }

    pub fn set_top_level_retry(&self, delay: i64) {
        *self.top_retry.write() = Some(delay);
    }

    pub fn set_top_level_async(&self, delay: i64) {
        *self.top_async.write() = Some(delay);
    }
}

impl WorkflowParamsSource for StaticWorkflowParams {
    fn connection_retry(&self, connection_id: u64) -> Option<i64> {
        self.connection_retry.read().get(&connection_id).copied()
    }

    fn connection_async(&self, connection_id: u64) -> Option<i64> {
        self.connection_async.read().get(&connection_id).copied()
    }

    fn workflow_type_retry(&self, class_id: ClassId) -> Option<i64> {
        self.workflow_retry.read().get(&class_id.0).copied()
    }

    fn workflow_type_async(&self, class_id: ClassId) -> Option<i64> {
        self.workflow_async.read().get(&class_id.0).copied()
    }

    fn top_level_retry(&self) -> Option<i64> {
        *self.top_retry.read()
    }

    fn top_level_async(&self) -> Option<i64> {
        *self.top_async.read()
    }
}
