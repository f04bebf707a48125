use std::sync::{LazyLock, RwLock};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

use crate::reconciler::ops::Stats;
use crate::{Error, Result};

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("mesh_lb")));

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Family<OperationLabels, Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: Histogram,
    pub desired_frontends: Gauge,
    pub pending_retries: Gauge,
}

impl ReconcileMetrics {
    /// Metrics that are not exported anywhere.
    pub fn unregistered() -> Self {
        Self {
            runs: Family::default(),
            failures: Family::default(),
            duration: Histogram::new([0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0].into_iter()),
            desired_frontends: Gauge::default(),
            pending_retries: Gauge::default(),
        }
    }

    pub fn new() -> Result<Self> {
        let metrics = Self::unregistered();
        let mut registry = REGISTRY.write().map_err(|_| Error::LockPoisoned)?;
        registry.register_with_unit(
            "reconcile_duration",
            "reconcile duration",
            Unit::Seconds,
            metrics.duration.clone(),
        );
        registry.register(
            "reconcile_failures",
            "Number of reconciliation errors",
            metrics.failures.clone(),
        );
        registry.register(
            "reconcile_runs",
            "Number of reconciliations",
            metrics.runs.clone(),
        );
        registry.register(
            "desired_frontends",
            "Frontends successfully written to the datapath",
            metrics.desired_frontends.clone(),
        );
        registry.register(
            "pending_retries",
            "Frontend operations waiting to be retried",
            metrics.pending_retries.clone(),
        );
        Ok(metrics)
    }

    pub fn count_failure(&self, operation: &str, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                operation: operation.into(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, operation: &str) -> ReconcileMeasurer {
        self.runs
            .get_or_create(&OperationLabels {
                operation: operation.into(),
            })
            .inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }
}

pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        self.metric.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Sizes of the reconciler bookkeeping.
#[derive(Clone, Default)]
pub struct StateMetrics {
    pub frontends: Gauge,
    pub backends: Gauge,
    pub service_ids: Gauge,
    pub backend_ids: Gauge,
}

impl StateMetrics {
    pub fn new() -> Result<Self> {
        let metrics = Self::default();
        let mut registry = REGISTRY.write().map_err(|_| Error::LockPoisoned)?;
        registry.register(
            "tracked_frontends",
            "Frontends with committed backend membership",
            metrics.frontends.clone(),
        );
        registry.register(
            "tracked_backends",
            "Backends known to the registry",
            metrics.backends.clone(),
        );
        registry.register(
            "allocated_service_ids",
            "Allocated service ids",
            metrics.service_ids.clone(),
        );
        registry.register(
            "allocated_backend_ids",
            "Allocated backend ids",
            metrics.backend_ids.clone(),
        );
        Ok(metrics)
    }

    pub fn record(&self, stats: &Stats) {
        self.frontends.set(to_gauge(stats.frontends));
        self.backends.set(to_gauge(stats.backends));
        self.service_ids.set(to_gauge(stats.service_ids));
        self.backend_ids.set(to_gauge(stats.backend_ids));
    }
}

pub(crate) fn to_gauge(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub operation: String,
    pub error: String,
}
