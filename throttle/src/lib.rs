//! Admit metered work with deterministic, replayable leaky buckets.
//!
//! A [LeakyBucket] holds a fixed amount of capacity that drains ("leaks") at a rate of its full
//! capacity per second. A [DeterministicThrottle] drives a bucket from caller-supplied
//! [Timestamp]s rather than a wall clock, so replaying the same sequence of decisions from a
//! restored [UsageSnapshot] always produces the same outcomes (even across process restarts).
//! A [GasLimitThrottle] adds a settlement step for resources that are reserved up front at a
//! worst-case estimate and corrected once the actual consumption is known.
//!
//! # Arithmetic
//!
//! All accounting is integer. Leaking `elapsed` nanoseconds from a bucket of capacity `C` frees
//! `floor(elapsed * C / 1_000_000_000)` units, computed with 128-bit intermediates so that any
//! `u64` capacity and any `u64` nanosecond interval can be combined without overflow.
//!
//! # Example
//!
//! ```rust
//! use ledger_throttle::{GasLimitThrottle, Timestamp};
//!
//! let mut throttle = GasLimitThrottle::new(1_000_000);
//! let now = Timestamp::from_epoch_seconds(1_234_567);
//!
//! // Reserve the gas limit of a transaction
//! assert!(throttle.allow(now, 100_000).unwrap());
//!
//! // The transaction only used 40_000, give the rest back
//! throttle.leak_unused_gas_previously_reserved(60_000);
//! assert_eq!(throttle.delegate().bucket().capacity_free(), 960_000);
//!
//! // Persist the state of the throttle (and restore it later)
//! let snapshot = throttle.usage_snapshot();
//! let mut restored = GasLimitThrottle::new(1_000_000);
//! restored.reset_usage_to(&snapshot).unwrap();
//! assert_eq!(restored.usage_snapshot(), snapshot);
//! ```

mod bucket;
pub use bucket::LeakyBucket;
mod deterministic;
pub use deterministic::DeterministicThrottle;
mod gas;
pub use gas::GasLimitThrottle;
mod metrics;
mod snapshot;
pub use snapshot::UsageSnapshot;
mod time;
pub use time::Timestamp;

use thiserror::Error;

/// Errors that can occur when interacting with a throttle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("insufficient capacity: requested {0}, free {1}")]
    InsufficientCapacity(u64, u64),
    #[error("used capacity {0} exceeds total capacity {1}")]
    UsedExceedsCapacity(u64, u64),
    #[error("decision at {0} precedes last decision at {1}")]
    NonMonotonicTime(Timestamp, Timestamp),
    #[error("invalid timestamp: {0}s {1}ns")]
    InvalidTimestamp(i64, i64),
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(&'static str),
}
