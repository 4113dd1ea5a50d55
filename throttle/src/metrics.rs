use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Decisions made by a throttle.
#[derive(Clone, Debug)]
pub(crate) struct Metrics {
    pub allowed: Counter,
    pub throttled: Counter,
    pub used: Gauge,
}

impl Metrics {
    /// Initialize the `Metrics` struct and register the metrics under `name` in the provided registry.
    pub fn new(registry: &mut Registry, name: &str) -> Self {
        let metrics = Self {
            allowed: Counter::default(),
            throttled: Counter::default(),
            used: Gauge::default(),
        };

        let registry = registry.sub_registry_with_prefix(name);
        registry.register(
            "allowed",
            "Number of decisions that reserved capacity",
            metrics.allowed.clone(),
        );
        registry.register(
            "throttled",
            "Number of decisions rejected for lack of capacity",
            metrics.throttled.clone(),
        );
        registry.register(
            "used",
            "Capacity in use after the last operation",
            metrics.used.clone(),
        );

        metrics
    }

    pub fn record_used(&self, used: u64) {
        self.used.set(i64::try_from(used).unwrap_or(i64::MAX));
    }
}
