//! TimedDataCache: a FIFO cache with a dynamically-tunable TTL and
//! per-class fast purge, per spec §4.4.
//!
//! The FIFO order is realized as a `BTreeMap` keyed by a monotonically
//! increasing insertion sequence number rather than a linked list with
//! stored iterators — the sequence number gives the same O(log n)
//! removal-by-key and head-peek operations the original's
//! iterator-into-list trick gives in O(1), without relying on a
//! container's iterator-stability guarantees (§9 design note on
//! generational indices).

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::SystemOptionsSource;
use crate::error::SetOutcome;
use crate::ids::{now, ClassId, Timestamp};

struct CacheEntry<K> {
    class_id: ClassId,
    key: K,
    submit_time: Timestamp,
}

struct TdcState<K> {
    fifo: BTreeMap<u64, CacheEntry<K>>,
    classmap: HashMap<ClassId, HashMap<K, u64>>,
    seq_counter: u64,
    term: bool,
}

impl<K> TdcState<K> {
    fn next_seq(&mut self) -> u64 {
        let seq = self.seq_counter;
        self.seq_counter += 1;
        seq
    }
}

/// A `TimedDataCache<OrderId>` is the order-id TDC; `TimedDataCache<String>`
/// is the sync-key TDC (spec §4.4: "`string` for sync keys, `int64` for
/// order ids").
pub struct TimedDataCache<K: Clone + Eq + Hash + Ord> {
    state: Mutex<TdcState<K>>,
    cond: Condvar,
    delay_name: String,
    max_name: Option<String>,
    options: Arc<dyn SystemOptionsSource>,
}

impl<K: Clone + Eq + Hash + Ord> TimedDataCache<K> {
    /// `delay_name` is the system-option key giving the TTL in seconds,
    /// re-read on every `get_event` iteration. `max_name`, if given, names
    /// the system option holding a hard size cap.
    pub fn new(delay_name: impl Into<String>, max_name: Option<String>, options: Arc<dyn SystemOptionsSource>) -> Self {
        Self {
            state: Mutex::new(TdcState {
                fifo: BTreeMap::new(),
                classmap: HashMap::new(),
                seq_counter: 0,
                term: false,
            }),
            cond: Condvar::new(),
            delay_name: delay_name.into(),
            max_name,
            options,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `key` at the tail (or relocates it there if already present
    /// under `class_id` — a *refresh*). Rejects the insert if `max_name` is
    /// set and the cache is already at capacity.
    pub fn set(&self, key: K, class_id: ClassId) -> SetOutcome {
        let max_size = self.max_name.as_ref().and_then(|n| self.options.get_i64(n));
        let mut state = self.state.lock();

        let existing_seq = state.classmap.get(&class_id).and_then(|m| m.get(&key).copied());

        let signal = if let Some(seq) = existing_seq {
            let is_head = state.fifo.keys().next() == Some(&seq);
            state.fifo.remove(&seq);
            let new_seq = state.next_seq();
            state.fifo.insert(
                new_seq,
                CacheEntry {
                    class_id,
                    key: key.clone(),
                    submit_time: now(),
                },
            );
            state.classmap.get_mut(&class_id).unwrap().insert(key, new_seq);
            is_head
        } else {
            if let Some(max) = max_size {
                if max >= 0 && state.fifo.len() as i64 >= max {
                    return SetOutcome::Rejected;
                }
            }
            let was_empty = state.fifo.is_empty();
            let new_seq = state.next_seq();
            state.fifo.insert(
                new_seq,
                CacheEntry {
                    class_id,
                    key: key.clone(),
                    submit_time: now(),
                },
            );
            state.classmap.entry(class_id).or_default().insert(key, new_seq);
            was_empty
        };

        drop(state);
        if signal {
            self.cond.notify_all();
        }
        SetOutcome::Stored
    }

    /// O(1)-via-index removal of a single entry.
    pub fn delete_key(&self, key: K, class_id: ClassId) {
        let mut state = self.state.lock();
        let Some(keymap) = state.classmap.get_mut(&class_id) else {
            return;
        };
        let Some(seq) = keymap.remove(&key) else {
            return;
        };
        if keymap.is_empty() {
            state.classmap.remove(&class_id);
        }
        let is_head = state.fifo.keys().next() == Some(&seq);
        state.fifo.remove(&seq);
        drop(state);
        if is_head {
            self.cond.notify_all();
        }
    }

    /// Removes every entry belonging to `class_id`; returns the purged keys.
    pub fn purge_class(&self, class_id: ClassId) -> Vec<K> {
        let mut state = self.state.lock();
        let Some(keymap) = state.classmap.remove(&class_id) else {
            return Vec::new();
        };
        let head_seq = state.fifo.keys().next().copied();
        let mut purged = Vec::with_capacity(keymap.len());
        let mut signal = false;
        for (key, seq) in keymap {
            if Some(seq) == head_seq {
                signal = true;
            }
            state.fifo.remove(&seq);
            purged.push(key);
        }
        drop(state);
        if signal {
            self.cond.notify_all();
        }
        purged
    }

    /// Blocks until the head entry's TTL expires or the cache is
    /// terminated. Re-reads the delay option on every iteration so a
    /// dynamic tuning change takes effect without restarting the wait.
    pub fn get_event(&self) -> Option<(ClassId, K, Timestamp)> {
        let mut state = self.state.lock();
        loop {
            if state.term {
                return None;
            }

            let head = match state.fifo.iter().next() {
                Some((&seq, entry)) => Some((seq, entry.class_id, entry.key.clone(), entry.submit_time)),
                None => None,
            };

            let Some((seq, class_id, key, submit_time)) = head else {
                self.cond.wait(&mut state);
                continue;
            };

            let delay = self.options.get_i64(&self.delay_name).unwrap_or(0);
            let diff = submit_time + delay - now();
            if diff > 0 {
                self.cond.wait_for(&mut state, Duration::from_secs(diff as u64));
                continue;
            }

            state.fifo.remove(&seq);
            if let Some(keymap) = state.classmap.get_mut(&class_id) {
                keymap.remove(&key);
                if keymap.is_empty() {
                    state.classmap.remove(&class_id);
                }
            }
            return Some((class_id, key, submit_time));
        }
    }

    /// Marks the cache terminated and wakes any blocked `get_event` caller.
    /// Precondition (debug-checked): the cache must be empty.
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.fifo.is_empty(), "TimedDataCache::terminate called with {} entries resident", state.fifo.len());
        state.term = true;
        drop(state);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticSystemOptions;

    fn cache(max: Option<i64>) -> TimedDataCache<String> {
        let opts = Arc::new(StaticSystemOptions::new());
        opts.set("tdc.delay", 5);
        if let Some(m) = max {
            opts.set("tdc.max", m);
        }
        TimedDataCache::new("tdc.delay", max.map(|_| "tdc.max".to_string()), opts)
    }

    #[test]
    fn purge_scenario_f() {
        let c = cache(Some(3));
        assert_eq!(c.set("A".into(), ClassId(1)), SetOutcome::Stored);
        assert_eq!(c.set("B".into(), ClassId(1)), SetOutcome::Stored);
        assert_eq!(c.set("C".into(), ClassId(2)), SetOutcome::Stored);
        assert_eq!(c.set("D".into(), ClassId(1)), SetOutcome::Rejected);

        let mut purged = c.purge_class(ClassId(1));
        purged.sort();
        assert_eq!(purged, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(c.len(), 1);

        assert_eq!(c.set("D".into(), ClassId(1)), SetOutcome::Stored);
    }

    #[test]
    fn refresh_relocates_to_tail() {
        let c = cache(None);
        c.set("A".into(), ClassId(1));
        c.set("B".into(), ClassId(1));
        // refresh A: it should no longer be the head
        c.set("A".into(), ClassId(1));
        c.delete_key("B".into(), ClassId(1));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn delete_key_is_noop_when_absent() {
        let c = cache(None);
        c.delete_key("missing".into(), ClassId(9));
        assert!(c.is_empty());
    }
}
