use anyhow::Result;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use std::net::SocketAddr;
use tracing::info;

/// Prometheus registry plus the round-watcher's own series. The monetary
/// gauges are lossy f64 views for dashboards; the exact values live in
/// the snapshot itself.
#[derive(Clone)]
pub struct MetricsHandle {
    registry: Registry,
    builds: IntCounter,
    build_failures: IntCounter,
    total_funds: Gauge,
    matching_pool: Gauge,
    contributions: Gauge,
}

impl MetricsHandle {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let builds = IntCounter::new(
            "round_snapshot_builds_total",
            "Snapshot builds that completed, including empty-registry results",
        )?;
        let build_failures = IntCounter::new(
            "round_snapshot_build_failures_total",
            "Snapshot builds aborted by a chain read error",
        )?;
        let total_funds = Gauge::new(
            "round_total_funds",
            "Total funds of the active round, token units",
        )?;
        let matching_pool = Gauge::new(
            "round_matching_pool",
            "Matching pool of the active round, token units",
        )?;
        let contributions = Gauge::new(
            "round_contributions",
            "Summed contributions of the active round, token units",
        )?;
        registry.register(Box::new(builds.clone()))?;
        registry.register(Box::new(build_failures.clone()))?;
        registry.register(Box::new(total_funds.clone()))?;
        registry.register(Box::new(matching_pool.clone()))?;
        registry.register(Box::new(contributions.clone()))?;
        Ok(Self {
            registry,
            builds,
            build_failures,
            total_funds,
            matching_pool,
            contributions,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_build(&self) {
        self.builds.inc();
    }

    pub fn record_failure(&self) {
        self.build_failures.inc();
    }

    pub fn set_totals(&self, total_funds: f64, matching_pool: f64, contributions: f64) {
        self.total_funds.set(total_funds);
        self.matching_pool.set(matching_pool);
        self.contributions.set(contributions);
    }

    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let registry = self.registry.clone();
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_req: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        encoder.encode(&metric_families, &mut buffer).unwrap();
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(200)
                                .header("Content-Type", encoder.format_type())
                                .body(Body::from(buffer))
                                .unwrap(),
                        )
                    }
                }))
            }
        });

        let server = Server::bind(&addr).serve(make_svc);
        info!(%addr, "metrics exporter listening");
        server.await?;
        Ok(())
    }
}
