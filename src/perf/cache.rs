//! PerformanceCache: a one-second sampling buffer plus a bounded rolling
//! history of derived `(average, throughput)` points, per spec §4.6.

use std::collections::VecDeque;
use std::sync::mpsc::Sender;

use parking_lot::Mutex;
use serde::Serialize;

use crate::ids::{now, Timestamp};

/// Rolling history depth (`PERFCACHE_HIST_SIZE` in the original).
const HISTORY_CAPACITY: usize = 120;

/// `3,600,000,000` microseconds per hour: converts an average
/// microseconds-per-sample figure into a throughput in samples/hour.
const MICROS_PER_HOUR: f64 = 3_600_000_000.0;

struct DataPoint {
    value: i64,
    time: Timestamp,
}

/// A deque of samples for the current one-second window, plus a running
/// sum so the average can be read in O(1).
#[derive(Default)]
struct DataPointList {
    points: VecDeque<DataPoint>,
    sum: f64,
}

impl DataPointList {
    fn push(&mut self, value: i64, time: Timestamp) {
        self.points.push_back(DataPoint { value, time });
        self.sum += value as f64;
    }

    /// Drops every sample whose time is `<= cutoff`.
    fn expire(&mut self, cutoff: Timestamp) {
        while let Some(front) = self.points.front() {
            if front.time > cutoff {
                break;
            }
            self.sum -= front.value as f64;
            if self.sum < 0.0 {
                self.sum = 0.0;
            }
            self.points.pop_front();
        }
    }

    /// `(average, throughput)`; both zero when the window is empty.
    fn average(&self) -> (f64, f64) {
        if self.points.is_empty() {
            return (0.0, 0.0);
        }
        let avg = self.sum / self.points.len() as f64;
        (avg, MICROS_PER_HOUR / avg)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PcHistoryEntry {
    pub avg_1s: f64,
    pub tp_1s: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PcHistorySnapshot {
    pub name: String,
    pub hist: Vec<PcHistoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PcSample {
    pub name: String,
    pub avg_1s: f64,
    pub tp_1s: f64,
}

/// Message pushed to a subscribed listener queue: the full history on
/// subscription, then one `Sample` per tick.
#[derive(Debug, Clone, Serialize)]
pub enum PcMessage {
    History(PcHistorySnapshot),
    Sample(PcSample),
}

struct PcState {
    one_sec: DataPointList,
    history: VecDeque<(f64, f64)>,
    listeners: Vec<Sender<PcMessage>>,
    running: bool,
    total_sum: f64,
    total_count: u64,
}

pub struct PerformanceCache {
    name: String,
    state: Mutex<PcState>,
}

impl PerformanceCache {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            state: Mutex::new(PcState {
                one_sec: DataPointList::default(),
                history: VecDeque::new(),
                listeners: Vec::new(),
                running: true,
                total_sum: 0.0,
                total_count: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a sample at the current time, unless the cache has been
    /// stopped.
    pub fn post(&self, value: i64) {
        let mut state = self.state.lock();
        if !state.running {
            return;
        }
        state.one_sec.push(value, now());
        state.total_sum += value as f64;
        state.total_count += 1;
    }

    /// Called once per tick by the manager. Publishes a sample to every
    /// listener and appends to history only while listeners exist, then
    /// unconditionally expires samples older than `now - 1`.
    pub fn pop(&self, now: Timestamp) {
        let mut state = self.state.lock();
        if !state.listeners.is_empty() {
            let (avg, tp) = state.one_sec.average();
            let sample = PcMessage::Sample(PcSample {
                name: self.name.clone(),
                avg_1s: avg,
                tp_1s: tp,
            });
            state.listeners.retain(|l| l.send(sample.clone()).is_ok());

            state.history.push_back((avg, tp));
            if state.history.len() > HISTORY_CAPACITY {
                state.history.pop_front();
            }
        }
        state.one_sec.expire(now - 1);
    }

    /// Subscribes `sender`; if history is non-empty it is pushed
    /// immediately so a late subscriber still sees the full window.
    pub fn add_listener_queue(&self, sender: Sender<PcMessage>) {
        let mut state = self.state.lock();
        if !state.history.is_empty() {
            let hist = state.history.iter().map(|&(avg_1s, tp_1s)| PcHistoryEntry { avg_1s, tp_1s }).collect();
            let _ = sender.send(PcMessage::History(PcHistorySnapshot {
                name: self.name.clone(),
                hist,
            }));
        }
        state.listeners.push(sender);
    }

    /// Drops all listeners and marks the cache not-running; further
    /// `post` calls become no-ops.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.listeners.clear();
        state.running = false;
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn tick_without_listeners_tracks_window_only() {
        let pc = PerformanceCache::new("p".into());
        let t = 1000;
        // scenario G: post 10, 20, 30 within [t, t+1)
        {
            let mut state = pc.state.lock();
            state.one_sec.push(10, t);
            state.one_sec.push(20, t);
            state.one_sec.push(30, t);
        }
        pc.pop(t + 1);
        assert_eq!(pc.history_len(), 0, "no listeners: no history recorded");
    }

    #[test]
    fn tick_with_listener_computes_average_and_throughput() {
        let pc = PerformanceCache::new("p".into());
        let (tx, rx) = channel();
        pc.add_listener_queue(tx);
        let t = 1000;
        {
            let mut state = pc.state.lock();
            state.one_sec.push(10, t);
            state.one_sec.push(20, t);
            state.one_sec.push(30, t);
        }
        pc.pop(t + 1);
        assert_eq!(pc.history_len(), 1);
        match rx.recv().unwrap() {
            PcMessage::Sample(s) => {
                assert!((s.avg_1s - 20.0).abs() < 1e-9);
                assert!((s.tp_1s - 1.8e8).abs() < 1.0);
            }
            other => panic!("expected a Sample message, got {other:?}"),
        }
    }

    #[test]
    fn late_subscriber_receives_full_history_snapshot() {
        let pc = PerformanceCache::new("p".into());
        for i in 0..5 {
            pc.pop(i);
            pc.state.lock().one_sec.push(1, i);
        }
        let (tx, rx) = channel();
        {
            // force at least one history entry to exist before subscribing
            let (tx0, _rx0) = channel();
            pc.add_listener_queue(tx0);
        }
        pc.post(1);
        pc.pop(100);
        pc.add_listener_queue(tx);
        match rx.recv().unwrap() {
            PcMessage::History(h) => assert_eq!(h.name, "p"),
            other => panic!("expected a History message, got {other:?}"),
        }
    }
}
