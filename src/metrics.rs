use crate::Error;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry,
};
use tokio::time::Instant;

/// Prometheus metrics exposed by the controllers
#[derive(Clone)]
pub struct Metrics {
    pub spot_migrator_operation_success_total: IntCounter,
    pub spot_migrator_operation_failure_total: IntCounter,
    pub annotator_reconciliations: IntCounter,
    pub annotator_failures: IntCounterVec,
    pub annotator_reconcile_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let spot_migrator_operation_success_total = IntCounter::new(
            "cost_manager_spot_migrator_operation_success_total",
            "The total number of successful spot-migrator operations",
        )
        .unwrap();
        let spot_migrator_operation_failure_total = IntCounter::new(
            "cost_manager_spot_migrator_operation_failure_total",
            "The total number of failed spot-migrator operations",
        )
        .unwrap();
        let annotator_reconciliations = IntCounter::new(
            "cost_manager_pod_safe_to_evict_annotator_reconciliations_total",
            "The total number of pod-safe-to-evict-annotator reconciliations",
        )
        .unwrap();
        let annotator_failures = IntCounterVec::new(
            opts!(
                "cost_manager_pod_safe_to_evict_annotator_reconciliation_errors_total",
                "The total number of pod-safe-to-evict-annotator reconciliation errors"
            ),
            &["pod", "error"],
        )
        .unwrap();
        let annotator_reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "cost_manager_pod_safe_to_evict_annotator_reconcile_duration_seconds",
                "The duration of pod-safe-to-evict-annotator reconciles in seconds",
                vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]
            ),
            &[],
        )
        .unwrap();
        Metrics {
            spot_migrator_operation_success_total,
            spot_migrator_operation_failure_total,
            annotator_reconciliations,
            annotator_failures,
            annotator_reconcile_duration,
        }
    }
}

impl Metrics {
    /// Register all collectors with the registry. Collectors must be registered
    /// exactly once per process.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.spot_migrator_operation_success_total.clone()))?;
        registry.register(Box::new(self.spot_migrator_operation_failure_total.clone()))?;
        registry.register(Box::new(self.annotator_reconciliations.clone()))?;
        registry.register(Box::new(self.annotator_failures.clone()))?;
        registry.register(Box::new(self.annotator_reconcile_duration.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, pod: &Pod, e: &Error) {
        self.annotator_failures
            .with_label_values(&[pod.name_any().as_ref(), e.metric_label().as_ref()])
            .inc()
    }

    #[must_use]
    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.annotator_reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.annotator_reconcile_duration.clone(),
        }
    }
}

/// Measures reconcile duration from creation until drop
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[]).observe(duration);
    }
}

#[cfg(test)]
mod test {
    use super::Metrics;
    use prometheus::Registry;

    #[test]
    fn metrics_register_and_gather() {
        let registry = Registry::default();
        let metrics = Metrics::default().register(&registry).unwrap();
        metrics.spot_migrator_operation_success_total.inc();
        metrics.spot_migrator_operation_failure_total.inc();

        let families = registry.gather();
        let names: Vec<&str> = families.iter().map(|family| family.get_name()).collect();
        assert!(names.contains(&"cost_manager_spot_migrator_operation_success_total"));
        assert!(names.contains(&"cost_manager_spot_migrator_operation_failure_total"));
        assert_eq!(metrics.spot_migrator_operation_success_total.get(), 1);
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::default();
        let _metrics = Metrics::default().register(&registry).unwrap();
        assert!(Metrics::default().register(&registry).is_err());
    }
}
