//! Metrics (spec.md §9 "ambient stack"): queue depth, idle agent count,
//! dispatch/interruption counters, benchmark cache hit rate, exposed on a
//! `/metrics` Axum endpoint for Prometheus scraping. Same shape as the
//! teacher's `telemetry_service` — a `ServiceRegistration` wrapping an Axum
//! server bound to its own port — with the hardcoded text response replaced
//! by a real `prometheus::Registry`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::persistence::Store;
use crate::platform::config::ObservabilitySettings;
use crate::platform::context::PlatformContext;
use crate::platform::service::ServiceRegistration;

pub struct Metrics {
    pub registry: Registry,
    pub idle_agents: IntGauge,
    pub queue_depth: IntGauge,
    pub tasks_assigned_total: IntCounter,
    pub interruptions_total: IntCounter,
    pub benchmark_cache_hits_total: IntCounter,
    pub benchmark_cache_misses_total: IntCounter,
    pub jobs_by_status: IntCounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let idle_agents = IntGauge::new("krakenhashes_idle_agents", "Agents currently idle").unwrap();
        let queue_depth = IntGauge::new("krakenhashes_queue_depth", "Pending jobs with available work").unwrap();
        let tasks_assigned_total =
            IntCounter::new("krakenhashes_tasks_assigned_total", "Tasks dispatched to agents").unwrap();
        let interruptions_total =
            IntCounter::new("krakenhashes_interruptions_total", "Running tasks preempted by higher priority jobs")
                .unwrap();
        let benchmark_cache_hits_total =
            IntCounter::new("krakenhashes_benchmark_cache_hits_total", "Benchmark lookups served from cache").unwrap();
        let benchmark_cache_misses_total = IntCounter::new(
            "krakenhashes_benchmark_cache_misses_total",
            "Benchmark lookups that required a fresh request",
        )
        .unwrap();
        let jobs_by_status = IntCounterVec::new(
            Opts::new("krakenhashes_job_transitions_total", "Job status transitions"),
            &["status"],
        )
        .unwrap();

        registry.register(Box::new(idle_agents.clone())).unwrap();
        registry.register(Box::new(queue_depth.clone())).unwrap();
        registry.register(Box::new(tasks_assigned_total.clone())).unwrap();
        registry.register(Box::new(interruptions_total.clone())).unwrap();
        registry.register(Box::new(benchmark_cache_hits_total.clone())).unwrap();
        registry.register(Box::new(benchmark_cache_misses_total.clone())).unwrap();
        registry.register(Box::new(jobs_by_status.clone())).unwrap();

        Self {
            registry,
            idle_agents,
            queue_depth,
            tasks_assigned_total,
            interruptions_total,
            benchmark_cache_hits_total,
            benchmark_cache_misses_total,
            jobs_by_status,
        }
    }
}

/// Process-wide metrics registry. A single process hosts one scheduler, so a
/// lazily-initialised global avoids threading a `Metrics` handle through
/// every call site that wants to bump a counter.
pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

pub fn telemetry_service(settings: ObservabilitySettings) -> ServiceRegistration {
    ServiceRegistration::new(
        "telemetry",
        Arc::new(move |ctx: PlatformContext, token: CancellationToken| {
            let settings = settings.clone();
            tokio::spawn(async move {
                let outcome: Result<()> = async {
                    if !settings.enable_metrics {
                        return Ok(());
                    }

                    let app = Router::new().route("/metrics", get(metrics_handler)).with_state(ctx);
                    let addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
                    let shutdown = token.clone();

                    let listener = tokio::net::TcpListener::bind(addr).await?;
                    info!(port = settings.metrics_port, "telemetry server started");

                    axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            shutdown.cancelled().await;
                            info!("shutting down telemetry server");
                        })
                        .await?;

                    Ok(())
                }
                .await;

                outcome
            })
        }),
    )
}

async fn metrics_handler(State(ctx): State<PlatformContext>) -> String {
    if let Ok(idle) = ctx.store().agents_idle().await {
        METRICS.idle_agents.set(idle.len() as i64);
    }
    if let Ok(jobs) = ctx.store().next_jobs_with_available_work(ctx.config().scheduler.max_job_priority).await {
        METRICS.queue_depth.set(jobs.len() as i64);
    }

    let encoder = TextEncoder::new();
    let metric_families = METRICS.registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}
