use crate::{metrics::Metrics, Error, LeakyBucket, Timestamp, UsageSnapshot};
use prometheus_client::registry::Registry;
use tracing::{debug, trace};

/// A throttle that makes decisions on a caller-supplied timeline.
///
/// Decisions must be presented in non-decreasing time order. Because the throttle never reads a
/// clock and only uses integer arithmetic, the outcome of a sequence of decisions depends only on
/// its inputs (and the state the throttle started from).
///
/// The throttle performs no internal synchronization: callers sharing a throttle across threads
/// must serialize access to it.
#[derive(Debug)]
pub struct DeterministicThrottle {
    name: String,
    bucket: LeakyBucket,
    last_decision_time: Option<Timestamp>,

    metrics: Option<Metrics>,
}

impl DeterministicThrottle {
    /// Create a throttle that admits at most `capacity` units per second.
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            bucket: LeakyBucket::new(capacity),
            last_decision_time: None,
            metrics: None,
        }
    }

    /// Register the decisions of this throttle (prefixed by its name) in `registry`.
    pub fn with_metrics(mut self, registry: &mut Registry) -> Self {
        let metrics = Metrics::new(registry, &self.name);
        metrics.record_used(self.bucket.capacity_used());
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u64 {
        self.bucket.capacity()
    }

    pub fn bucket(&self) -> &LeakyBucket {
        &self.bucket
    }

    pub fn last_decision_time(&self) -> Option<Timestamp> {
        self.last_decision_time
    }

    /// Decide whether `required_units` can be admitted at `now`.
    ///
    /// Capacity that leaked since the last decision is drained first. The time of the decision is
    /// recorded whether or not the units are admitted.
    ///
    /// Returns [Error::NonMonotonicTime] (without modifying the throttle) if `now` precedes the
    /// last decision.
    pub fn allow(&mut self, now: Timestamp, required_units: u64) -> Result<bool, Error> {
        let elapsed = self.elapsed_nanos(now)?;
        self.bucket.leak(elapsed);
        let allowed = self.bucket.use_capacity(required_units).is_ok();
        self.last_decision_time = Some(now);

        if let Some(metrics) = &self.metrics {
            if allowed {
                metrics.allowed.inc();
            } else {
                metrics.throttled.inc();
            }
            metrics.record_used(self.bucket.capacity_used());
        }
        if !allowed {
            trace!(
                throttle = %self.name,
                required_units,
                free = self.bucket.capacity_free(),
                "throttled"
            );
        }
        Ok(allowed)
    }

    /// Percentage of capacity that would be in use at `now` once leaked capacity is drained.
    ///
    /// The throttle is not modified. A time before the last decision reports the current usage.
    pub fn percent_used(&self, now: Timestamp) -> f64 {
        let capacity = self.bucket.capacity();
        if capacity == 0 {
            return 0.0;
        }
        let mut bucket = self.bucket.clone();
        if let Ok(elapsed) = self.elapsed_nanos(now) {
            bucket.leak(elapsed);
        }
        100.0 * bucket.capacity_used() as f64 / capacity as f64
    }

    pub fn usage_snapshot(&self) -> UsageSnapshot {
        UsageSnapshot::new(self.bucket.capacity_used(), self.last_decision_time)
    }

    /// Overwrite the usage of the throttle with a previously taken [UsageSnapshot].
    ///
    /// No capacity is leaked: the next decision leaks based on the time elapsed since the
    /// restored decision time.
    pub fn reset_usage_to(&mut self, snapshot: &UsageSnapshot) -> Result<(), Error> {
        self.bucket.reset_used(snapshot.used())?;
        self.last_decision_time = snapshot.last_decision_time();
        if let Some(metrics) = &self.metrics {
            metrics.record_used(snapshot.used());
        }
        debug!(
            throttle = %self.name,
            used = snapshot.used(),
            last_decision_time = ?snapshot.last_decision_time(),
            "reset usage"
        );
        Ok(())
    }

    /// Return capacity that was reserved but never consumed.
    pub(crate) fn leak_unused(&mut self, amount: u64) {
        self.bucket.leak_unused(amount);
        if let Some(metrics) = &self.metrics {
            metrics.record_used(self.bucket.capacity_used());
        }
    }

    fn elapsed_nanos(&self, now: Timestamp) -> Result<u64, Error> {
        let Some(last) = self.last_decision_time else {
            return Ok(0);
        };
        if now < last {
            return Err(Error::NonMonotonicTime(now, last));
        }
        Ok(u64::try_from(now.nanos_since(&last)).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use prometheus_client::encoding::text::encode;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const CAPACITY: u64 = 1_000_000;

    fn start() -> Timestamp {
        Timestamp::from_epoch_seconds(1_234_567)
    }

    #[test]
    fn test_first_decision_uses_no_elapsed_time() {
        let mut throttle = DeterministicThrottle::new("test", CAPACITY);
        assert!(throttle.last_decision_time().is_none());

        assert!(throttle.allow(start(), 100_000).unwrap());
        assert_eq!(throttle.bucket().capacity_free(), 900_000);
        assert_eq!(throttle.last_decision_time(), Some(start()));
    }

    #[test]
    fn test_exact_accounting_at_same_instant() {
        let mut throttle = DeterministicThrottle::new("test", CAPACITY);
        assert!(throttle.allow(start(), 100_000).unwrap());
        assert!(throttle.allow(start(), 100_000).unwrap());
        assert_eq!(throttle.bucket().capacity_free(), 800_000);
    }

    #[test]
    fn test_leaks_elapsed_time() {
        let mut throttle = DeterministicThrottle::new("test", CAPACITY);
        assert!(throttle.allow(start(), 100_000).unwrap());
        assert_eq!(throttle.bucket().capacity_free(), 900_000);

        // floor(1234 * 1_000_000 / 1e9) = 1
        assert!(throttle.allow(start().plus_nanos(1_234), 100_000).unwrap());
        assert_eq!(throttle.bucket().capacity_free(), 800_001);
    }

    #[test]
    fn test_rejects_non_monotonic_time() {
        let mut throttle = DeterministicThrottle::new("test", CAPACITY);
        assert!(throttle.allow(start(), 100_000).unwrap());
        let before = throttle.usage_snapshot();

        let illegal = start().minus_nanos(1);
        for units in [0, 1, 100_000, u64::MAX] {
            assert_eq!(
                throttle.allow(illegal, units),
                Err(Error::NonMonotonicTime(illegal, start()))
            );
        }
        assert_eq!(throttle.usage_snapshot(), before);

        // The same instant is still fine
        assert!(throttle.allow(start(), 100_000).unwrap());
    }

    #[test]
    fn test_rejection_still_advances_time() {
        let mut throttle = DeterministicThrottle::new("test", CAPACITY);
        assert!(throttle.allow(start(), CAPACITY).unwrap());

        // Half a second frees half the bucket, not enough for the whole bucket
        let later = start().plus_nanos(500_000_000);
        assert!(!throttle.allow(later, CAPACITY).unwrap());
        assert_eq!(throttle.last_decision_time(), Some(later));
        assert_eq!(throttle.bucket().capacity_used(), CAPACITY / 2);

        // The leak already applied is not applied again
        assert!(!throttle.allow(later, CAPACITY / 2 + 1).unwrap());
        assert!(throttle.allow(later, CAPACITY / 2).unwrap());
    }

    #[test]
    fn test_percent_used() {
        let mut throttle = DeterministicThrottle::new("test", CAPACITY);
        assert_eq!(throttle.percent_used(start()), 0.0);

        assert!(throttle.allow(start(), CAPACITY / 2).unwrap());
        assert_eq!(throttle.percent_used(start()), 50.0);
        assert_eq!(throttle.percent_used(start().plus_nanos(250_000_000)), 25.0);
        assert_eq!(throttle.percent_used(start().plus_nanos(1_000_000_000)), 0.0);

        // Past times report the current usage, and nothing changes
        assert_eq!(throttle.percent_used(start().minus_nanos(1)), 50.0);
        assert_eq!(throttle.bucket().capacity_used(), CAPACITY / 2);

        let empty = DeterministicThrottle::new("empty", 0);
        assert_eq!(empty.percent_used(start()), 0.0);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let mut throttle = DeterministicThrottle::new("test", CAPACITY);
        assert!(throttle.allow(start(), 1234).unwrap());
        let snapshot = throttle.usage_snapshot();
        assert_eq!(snapshot.used(), 1234);
        assert_eq!(snapshot.last_decision_time(), Some(start()));

        let mut restored = DeterministicThrottle::new("test", CAPACITY);
        let snapshot = UsageSnapshot::new(CAPACITY / 2, Some(start()));
        restored.reset_usage_to(&snapshot).unwrap();
        assert_eq!(restored.bucket().capacity_used(), CAPACITY / 2);
        assert_eq!(restored.usage_snapshot(), snapshot);

        // Reset does not leak, the next decision does
        assert!(!restored
            .allow(start().plus_nanos(1_000), CAPACITY / 2 + 2)
            .unwrap());
        assert!(restored
            .allow(start().plus_nanos(1_000), CAPACITY / 2 + 1)
            .unwrap());
    }

    #[test]
    fn test_reset_rejects_oversized_snapshot() {
        let mut throttle = DeterministicThrottle::new("test", CAPACITY);
        assert!(throttle.allow(start(), 10).unwrap());
        let snapshot = UsageSnapshot::new(CAPACITY + 1, None);
        assert_eq!(
            throttle.reset_usage_to(&snapshot),
            Err(Error::UsedExceedsCapacity(CAPACITY + 1, CAPACITY))
        );
        assert_eq!(throttle.usage_snapshot(), UsageSnapshot::new(10, Some(start())));
    }

    #[test]
    fn test_replay_from_persisted_snapshot() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut original = DeterministicThrottle::new("test", CAPACITY);
        let mut now = start();
        for _ in 0..100 {
            now = now.plus_nanos(rng.gen_range(0..10_000_000));
            original.allow(now, rng.gen_range(0..50_000)).unwrap();
        }

        // Persist and reload (as if across a restart)
        let encoded = original.usage_snapshot().encode();
        let mut restored = DeterministicThrottle::new("test", CAPACITY);
        restored
            .reset_usage_to(&UsageSnapshot::decode(&encoded).unwrap())
            .unwrap();

        for _ in 0..1_000 {
            now = now.plus_nanos(rng.gen_range(0..10_000_000));
            let units = rng.gen_range(0..50_000);
            assert_eq!(
                original.allow(now, units).unwrap(),
                restored.allow(now, units).unwrap()
            );
            assert_eq!(original.usage_snapshot(), restored.usage_snapshot());
        }
    }

    #[test]
    fn test_metrics() {
        let mut registry = Registry::default();
        let mut throttle = DeterministicThrottle::new("gas", 100).with_metrics(&mut registry);
        assert!(throttle.allow(start(), 60).unwrap());
        assert!(!throttle.allow(start(), 60).unwrap());
        assert!(throttle.allow(start(), 40).unwrap());

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("gas_allowed_total 2"), "{buffer}");
        assert!(buffer.contains("gas_throttled_total 1"), "{buffer}");
        assert!(buffer.contains("gas_used 100"), "{buffer}");
    }

    proptest! {
        #[test]
        fn prop_leak_never_increases_usage(
            reserved in 0u64..=CAPACITY,
            delta in 0u64..=2_000_000_000,
        ) {
            let mut throttle = DeterministicThrottle::new("test", CAPACITY);
            prop_assert!(throttle.allow(start(), reserved).unwrap());
            prop_assert!(throttle.allow(start().plus_nanos(delta), 0).unwrap());

            let leaked = (delta as u128 * CAPACITY as u128 / 1_000_000_000) as u64;
            prop_assert_eq!(
                throttle.bucket().capacity_used(),
                reserved.saturating_sub(leaked)
            );
        }

        #[test]
        fn prop_snapshot_reproduces_decisions(
            before in proptest::collection::vec((0u64..50_000_000, 0u64..400_000), 0..32),
            after in proptest::collection::vec((0u64..50_000_000, 0u64..400_000), 1..32),
        ) {
            let mut original = DeterministicThrottle::new("test", CAPACITY);
            let mut now = start();
            for (delta, units) in before {
                now = now.plus_nanos(delta);
                original.allow(now, units).unwrap();
            }

            let mut restored = DeterministicThrottle::new("test", CAPACITY);
            restored.reset_usage_to(&original.usage_snapshot()).unwrap();
            for (delta, units) in after {
                now = now.plus_nanos(delta);
                prop_assert_eq!(
                    original.allow(now, units).unwrap(),
                    restored.allow(now, units).unwrap()
                );
                prop_assert_eq!(original.usage_snapshot(), restored.usage_snapshot());
            }
        }
    }
}
