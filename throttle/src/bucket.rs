use crate::{time::NANOS_PER_SECOND, Error};

/// A fixed-capacity counter that drains at a rate of its full capacity per second.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeakyBucket {
    capacity: u64,
    used: u64,
}

impl LeakyBucket {
    /// Create an empty bucket.
    pub fn new(capacity: u64) -> Self {
        Self { capacity, used: 0 }
    }

    /// Create a bucket with some capacity already in use (i.e. when restoring a snapshot).
    pub fn new_with_used(capacity: u64, used: u64) -> Result<Self, Error> {
        if used > capacity {
            return Err(Error::UsedExceedsCapacity(used, capacity));
        }
        Ok(Self { capacity, used })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn capacity_free(&self) -> u64 {
        self.capacity - self.used
    }

    pub fn capacity_used(&self) -> u64 {
        self.used
    }

    /// Consume `amount` units of capacity.
    ///
    /// If less than `amount` is free, nothing is consumed.
    pub fn use_capacity(&mut self, amount: u64) -> Result<(), Error> {
        let free = self.capacity_free();
        if amount > free {
            return Err(Error::InsufficientCapacity(amount, free));
        }
        self.used += amount;
        Ok(())
    }

    /// Drain the capacity that leaks out of the bucket over `elapsed_nanos`.
    pub fn leak(&mut self, elapsed_nanos: u64) {
        // Can't overflow: u64::MAX * u64::MAX < u128::MAX
        let leaked = elapsed_nanos as u128 * self.capacity as u128 / NANOS_PER_SECOND as u128;
        let leaked = u64::try_from(leaked).unwrap_or(u64::MAX);
        self.used = self.used.saturating_sub(leaked);
    }

    /// Return `amount` units that were reserved but never consumed.
    pub fn leak_unused(&mut self, amount: u64) {
        self.used = self.used.saturating_sub(amount);
    }

    /// Overwrite the capacity in use.
    pub(crate) fn reset_used(&mut self, used: u64) -> Result<(), Error> {
        if used > self.capacity {
            return Err(Error::UsedExceedsCapacity(used, self.capacity));
        }
        self.used = used;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn test_new_with_used() {
        let bucket = LeakyBucket::new_with_used(1_000, 400).unwrap();
        assert_eq!(bucket.capacity_used(), 400);
        assert_eq!(bucket.capacity_free(), 600);

        let full = LeakyBucket::new_with_used(1_000, 1_000).unwrap();
        assert_eq!(full.capacity_free(), 0);

        assert_eq!(
            LeakyBucket::new_with_used(1_000, 1_001),
            Err(Error::UsedExceedsCapacity(1_001, 1_000))
        );
    }

    #[test]
    fn test_use_capacity_is_all_or_nothing() {
        let mut bucket = LeakyBucket::new(1_000);
        bucket.use_capacity(700).unwrap();

        // Too much requested, nothing consumed
        assert_eq!(
            bucket.use_capacity(301),
            Err(Error::InsufficientCapacity(301, 300))
        );
        assert_eq!(bucket.capacity_used(), 700);

        // Exactly what's left
        bucket.use_capacity(300).unwrap();
        assert_eq!(bucket.capacity_free(), 0);
        bucket.use_capacity(0).unwrap();
    }

    #[test_case(1_000_000, 1_234, 1; "sub-unit leak truncates")]
    #[test_case(1_000_000, 1_000_000_000, 1_000_000; "one second drains capacity")]
    #[test_case(3, 500_000_000, 1; "half second of three units")]
    #[test_case(u64::MAX, u64::MAX, u64::MAX; "no overflow at the extremes")]
    #[test_case(1_000_000_000_000_000_000, 100 * 365 * 86_400 * 1_000_000_000, u64::MAX; "century of nanos")]
    fn test_leak_amount(capacity: u64, elapsed: u64, expected_freed: u64) {
        let mut bucket = LeakyBucket::new_with_used(capacity, capacity).unwrap();
        bucket.leak(elapsed);
        assert_eq!(bucket.capacity_free(), expected_freed.min(capacity));
    }

    #[test]
    fn test_leak_clamps_at_zero() {
        let mut bucket = LeakyBucket::new_with_used(1_000, 10).unwrap();
        bucket.leak(1_000_000_000);
        assert_eq!(bucket.capacity_used(), 0);

        bucket.leak(u64::MAX);
        assert_eq!(bucket.capacity_used(), 0);
    }

    #[test]
    fn test_leak_unused() {
        let mut bucket = LeakyBucket::new(1_000);
        bucket.use_capacity(100).unwrap();
        bucket.leak_unused(40);
        assert_eq!(bucket.capacity_used(), 60);
        bucket.leak_unused(100);
        assert_eq!(bucket.capacity_used(), 0);
    }

    #[test]
    fn test_reset_used() {
        let mut bucket = LeakyBucket::new(1_000);
        bucket.reset_used(999).unwrap();
        assert_eq!(bucket.capacity_used(), 999);
        assert_eq!(
            bucket.reset_used(1_001),
            Err(Error::UsedExceedsCapacity(1_001, 1_000))
        );
        assert_eq!(bucket.capacity_used(), 999);
    }

    proptest! {
        #[test]
        fn prop_used_never_exceeds_capacity(
            capacity in 0u64..=u64::MAX,
            ops in proptest::collection::vec((0u8..3, any::<u64>()), 0..64),
        ) {
            let mut bucket = LeakyBucket::new(capacity);
            for (op, amount) in ops {
                match op {
                    0 => {
                        let before = bucket.capacity_used();
                        if bucket.use_capacity(amount).is_err() {
                            prop_assert_eq!(bucket.capacity_used(), before);
                        }
                    }
                    1 => bucket.leak(amount),
                    _ => bucket.leak_unused(amount),
                }
                prop_assert!(bucket.capacity_used() <= bucket.capacity());
            }
        }

        #[test]
        fn prop_leak_matches_formula(
            capacity in 0u64..=1_000_000_000_000_000_000,
            used_fraction in 0u64..=100,
            elapsed in 0u64..=u64::MAX,
        ) {
            let used = (capacity as u128 * used_fraction as u128 / 100) as u64;
            let mut bucket = LeakyBucket::new_with_used(capacity, used).unwrap();
            bucket.leak(elapsed);
            let leaked = elapsed as u128 * capacity as u128 / 1_000_000_000;
            let expected = (used as u128).saturating_sub(leaked) as u64;
            prop_assert_eq!(bucket.capacity_used(), expected);
        }
    }
}
