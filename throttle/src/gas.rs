use crate::{DeterministicThrottle, Error, Timestamp, UsageSnapshot};
use prometheus_client::registry::Registry;

/// A [DeterministicThrottle] for gas, which is reserved at admission and settled afterwards.
///
/// A transaction is admitted against its gas limit (the worst case). Once the gas it actually
/// consumed is known, the difference is handed back with
/// [GasLimitThrottle::leak_unused_gas_previously_reserved] without leaking any time-based
/// capacity a second time.
#[derive(Debug)]
pub struct GasLimitThrottle {
    delegate: DeterministicThrottle,
}

impl GasLimitThrottle {
    /// Create a throttle admitting at most `capacity` gas per second.
    pub fn new(capacity: u64) -> Self {
        Self {
            delegate: DeterministicThrottle::new("gas", capacity),
        }
    }

    /// Register the decisions of this throttle in `registry`.
    pub fn with_metrics(self, registry: &mut Registry) -> Self {
        Self {
            delegate: self.delegate.with_metrics(registry),
        }
    }

    /// Reserve `gas_limit` at `now` (see [DeterministicThrottle::allow]).
    pub fn allow(&mut self, now: Timestamp, gas_limit: u64) -> Result<bool, Error> {
        self.delegate.allow(now, gas_limit)
    }

    /// Return `amount` of gas that was reserved by [GasLimitThrottle::allow] but not consumed.
    pub fn leak_unused_gas_previously_reserved(&mut self, amount: u64) {
        self.delegate.leak_unused(amount);
    }

    pub fn capacity(&self) -> u64 {
        self.delegate.capacity()
    }

    pub fn usage_snapshot(&self) -> UsageSnapshot {
        self.delegate.usage_snapshot()
    }

    pub fn reset_usage_to(&mut self, snapshot: &UsageSnapshot) -> Result<(), Error> {
        self.delegate.reset_usage_to(snapshot)
    }

    pub fn delegate(&self) -> &DeterministicThrottle {
        &self.delegate
    }
}
