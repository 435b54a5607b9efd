//! Named throughput/latency samplers with a 1 Hz background aggregator.

pub mod cache;
pub mod manager;

pub use cache::{PcHistoryEntry, PcHistorySnapshot, PcMessage, PcSample, PerformanceCache};
pub use manager::PerformanceCacheManager;
