use prometheus_client::{metrics::counter::Counter, registry::Registry};

/// Reconciler counters, exposed on the admin endpoint.
#[derive(Clone, Debug)]
pub(crate) struct Metrics {
    reconciles: Counter,
    reconcile_errors: Counter,
    skipped_services: Counter,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let reconciles = Counter::default();
        registry.register(
            "reconciles",
            "Reconcile cycles that published a configuration",
            reconciles.clone(),
        );

        let reconcile_errors = Counter::default();
        registry.register(
            "reconcile_errors",
            "Reconcile cycles that failed without publishing",
            reconcile_errors.clone(),
        );

        let skipped_services = Counter::default();
        registry.register(
            "skipped_services",
            "Services skipped because of configuration errors",
            skipped_services.clone(),
        );

        Self {
            reconciles,
            reconcile_errors,
            skipped_services,
        }
    }

    pub fn reconcile_ok(&self) {
        self.reconciles.inc();
    }

    pub fn reconcile_failed(&self) {
        self.reconcile_errors.inc();
    }

    pub fn service_skipped(&self) {
        self.skipped_services.inc();
    }
}
