// src/metrics/mod.rs
//
// A pull-based Prometheus endpoint computed fresh on every scrape from live
// Proxy/HealthChecker snapshots, rather than accumulated into persistent
// per-backend gauge vectors — a backend that's retired must stop appearing
// in `hacox_backends_health` and `hacox_clients_count` on the very next
// scrape, which a registered `IntGaugeVec` would not do on its own.

mod server;

pub use server::serve;

use crate::health::HealthChecker;
use crate::proxy::Proxy;
use prometheus::core::{Collector as PromCollector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, IntGauge, IntGaugeVec, Opts};
use std::sync::Arc;

pub struct Collector {
    proxy: Arc<Proxy>,
    health: Arc<HealthChecker>,
}

impl Collector {
    pub fn new(proxy: Arc<Proxy>, health: Arc<HealthChecker>) -> Self {
        Self { proxy, health }
    }
}

impl PromCollector for Collector {
    fn desc(&self) -> Vec<&Desc> {
        // Descriptors are generated per-scrape alongside the metrics
        // themselves (see `collect`), so there's nothing static to hand out
        // here; the registry only uses this for duplicate-registration
        // checks, which a single collector instance can't trigger.
        Vec::new()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let health_snapshot = self.health.snapshot();
        let known = self.proxy.known_backends();
        let connections = self.proxy.connection_counts();

        let mut families = Vec::with_capacity(3);

        let count = IntGauge::with_opts(Opts::new(
            "hacox_backends_count",
            "number of distinct backends currently tracked by the health checker",
        ))
        .expect("static metric options are valid");
        count.set(health_snapshot.len() as i64);
        families.extend(count.collect());

        let health_vec = GaugeVec::new(
            Opts::new("hacox_backends_health", "1 if the backend is healthy, 0 otherwise"),
            &["backend"],
        )
        .expect("static metric options are valid");
        for (backend, healthy) in &health_snapshot {
            health_vec
                .with_label_values(&[backend.as_str()])
                .set(if *healthy { 1.0 } else { 0.0 });
        }
        families.extend(health_vec.collect());

        let clients_vec = IntGaugeVec::new(
            Opts::new("hacox_clients_count", "active forwarded connections per backend"),
            &["backend"],
        )
        .expect("static metric options are valid");
        for backend in &known {
            let count = connections.get(backend).copied().unwrap_or(0);
            clients_vec.with_label_values(&[backend.as_str()]).set(count as i64);
        }
        families.extend(clients_vec.collect());

        families
    }
}
