//! PerformanceCacheManager: a name-keyed registry of `PerformanceCache`s
//! with a manager-owned reference count, ticked by a single 1 Hz background
//! thread, per spec §4.6.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, instrument};

use crate::error::PerfError;
use crate::ids::now;
use crate::perf::cache::PerformanceCache;

struct PcmState {
    caches: HashMap<String, (Arc<PerformanceCache>, u64)>,
    stop: bool,
    running: bool,
}

/// The manager's own reference count on a cache is independent of how many
/// `Arc<PerformanceCache>` clones external callers hold — it tracks how
/// many `add()` calls are outstanding against a `del()` call, so the
/// registry entry is removed only when the last caller releases it.
pub struct PerformanceCacheManager {
    state: Mutex<PcmState>,
    cevent: Condvar,
    cstop: Condvar,
}

impl Default for PerformanceCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceCacheManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PcmState {
                caches: HashMap::new(),
                stop: false,
                running: false,
            }),
            cevent: Condvar::new(),
            cstop: Condvar::new(),
        }
    }

    /// Returns the named cache, creating it on first call. Each call
    /// increments the manager's reference count for that name.
    pub fn add(&self, name: impl Into<String>) -> Arc<PerformanceCache> {
        let name = name.into();
        let mut state = self.state.lock();
        if let Some((cache, count)) = state.caches.get_mut(&name) {
            *count += 1;
            return Arc::clone(cache);
        }
        let cache = Arc::new(PerformanceCache::new(name.clone()));
        state.caches.insert(name, (Arc::clone(&cache), 1));
        cache
    }

    /// Releases one reference to `pc`'s registry entry; stops and removes
    /// the cache once the count reaches zero.
    pub fn del(&self, pc: &Arc<PerformanceCache>) {
        let mut state = self.state.lock();
        let name = pc.name().to_string();
        let Some((cache, count)) = state.caches.get_mut(&name) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            cache.stop();
            state.caches.remove(&name);
        }
    }

    /// Spawns the 1 Hz tick thread. Returns an error only if the OS
    /// refuses to create the thread.
    pub fn start(self: &Arc<Self>) -> Result<(), PerfError> {
        let mut state = self.state.lock();
        debug_assert!(!state.stop);
        debug_assert!(!state.running);
        state.running = true;
        drop(state);

        let manager = Arc::clone(self);
        thread::Builder::new()
            .name("performance-cache-manager".into())
            .spawn(move || manager.run())
            .map_err(PerfError::ThreadSpawn)?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn run(&self) {
        loop {
            let mut state = self.state.lock();
            if state.stop {
                break;
            }
            self.cevent.wait_for(&mut state, Duration::from_secs(1));
            if state.stop {
                break;
            }
            let tick = now();
            debug!(tick, caches = state.caches.len(), "performance cache tick");
            for (cache, _) in state.caches.values() {
                cache.pop(tick);
            }
        }

        let mut state = self.state.lock();
        state.running = false;
        drop(state);
        self.cstop.notify_all();
    }

    /// Stops every registered cache, clears the registry, and blocks until
    /// the tick thread has exited.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.stop = true;
        for (cache, _) in state.caches.values() {
            cache.stop();
        }
        state.caches.clear();
        drop(state);
        self.cevent.notify_all();

        let mut state = self.state.lock();
        while state.running {
            self.cstop.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_reuses_existing_cache_by_name() {
        let mgr = PerformanceCacheManager::new();
        let a = mgr.add("p");
        let b = mgr.add("p");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn del_removes_only_at_zero_refcount() {
        let mgr = PerformanceCacheManager::new();
        let a = mgr.add("p");
        let _b = mgr.add("p");
        mgr.del(&a);
        assert_eq!(mgr.state.lock().caches.len(), 1);
        mgr.del(&a);
        assert_eq!(mgr.state.lock().caches.len(), 0);
    }
}
