use super::task::Op;
use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
};

/// Label for operation metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Operation {
    pub op: Op,
}

impl From<Op> for Operation {
    fn from(op: Op) -> Self {
        Self { op }
    }
}

/// Metrics for the [`Engine`](super::Engine).
#[derive(Default)]
pub struct Metrics {
    /// Number of registered shards
    pub shards: Gauge,
    /// Number of shards being initialized
    pub initializing: Gauge,
    /// Number of available shards
    pub available: Gauge,
    /// Number of errored shards
    pub errored: Gauge,
    /// Number of outstanding references across all shards
    pub references: Gauge,
    /// Number of callers waiting on in-flight operations
    pub waiters: Gauge,
    /// Number of operations applied by type
    pub operations: Family<Operation, Counter>,
    /// Number of failures recorded against shards
    pub failures: Counter,
    /// Number of mount fetches started
    pub fetches: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register(
            "shards",
            "Number of registered shards",
            metrics.shards.clone(),
        );
        context.register(
            "initializing",
            "Number of shards being initialized",
            metrics.initializing.clone(),
        );
        context.register(
            "available",
            "Number of available shards",
            metrics.available.clone(),
        );
        context.register(
            "errored",
            "Number of errored shards",
            metrics.errored.clone(),
        );
        context.register(
            "references",
            "Number of outstanding references across all shards",
            metrics.references.clone(),
        );
        context.register(
            "waiters",
            "Number of callers waiting on in-flight operations",
            metrics.waiters.clone(),
        );
        context.register(
            "operations",
            "Number of operations applied by type",
            metrics.operations.clone(),
        );
        context.register(
            "failures",
            "Number of failures recorded against shards",
            metrics.failures.clone(),
        );
        context.register(
            "fetches",
            "Number of mount fetches started",
            metrics.fetches.clone(),
        );
        metrics
    }
}
