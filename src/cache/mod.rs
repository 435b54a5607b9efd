//! Time-bounded caches: the Timed Data Cache and Order Expiry Cache.

pub mod oec;
pub mod tdc;
