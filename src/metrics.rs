//! Prometheus metrics, behind the `metrics` feature (default-on), matching
//! `eosin-storage-operator`'s `ControllerMetrics`-behind-`cfg(feature =
//! "metrics")` convention. The teacher repo has no metrics stack of its
//! own (it logs with bare `eprintln!`); this module is enriched from the
//! pack.
//!
//! Emits exactly the series spec.md §4.3 and §4.4 call for.

#[cfg(feature = "metrics")]
mod imp {
    use prometheus::{
        HistogramVec, IntCounterVec, IntGaugeVec, Registry, register_histogram_vec_with_registry,
        register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
    };
    use std::sync::OnceLock;

    /// Metrics emitted by the WarmPool reconciler (C3) and Sandbox
    /// reconciler (C4), all labelled by pool name per spec.md.
    pub struct ControllerMetrics {
        pub registry: Registry,
        pub pending_pods: IntGaugeVec,
        pub pod_schedule_latency: HistogramVec,
        pub pod_ready_latency: HistogramVec,
        pub first_pod_ready_latency: HistogramVec,
        pub all_pods_ready_latency: HistogramVec,
        pub container_start_latency: HistogramVec,
        pub image_pull_errors: IntCounterVec,
        pub pod_deletes: IntCounterVec,
        pub sandbox_ready_latency: HistogramVec,
        pub idle_duration: HistogramVec,
        pub no_idle_pods: IntCounterVec,
    }

    impl ControllerMetrics {
        fn new() -> Self {
            let registry = Registry::new();
            ControllerMetrics {
                pending_pods: register_int_gauge_vec_with_registry!(
                    "sandboxctl_pool_pending_pods",
                    "Pods created but not yet ready, per pool",
                    &["pool"],
                    registry
                )
                .unwrap(),
                pod_schedule_latency: register_histogram_vec_with_registry!(
                    "sandboxctl_pool_pod_schedule_latency_seconds",
                    "Time from pod create to scheduled, per pool",
                    &["pool"],
                    registry
                )
                .unwrap(),
                pod_ready_latency: register_histogram_vec_with_registry!(
                    "sandboxctl_pool_pod_ready_latency_seconds",
                    "Time from pod create to Ready, per pool and node",
                    &["pool", "node"],
                    registry
                )
                .unwrap(),
                first_pod_ready_latency: register_histogram_vec_with_registry!(
                    "sandboxctl_pool_first_pod_ready_latency_seconds",
                    "Time from scale-out event to first new Ready pod, per pool",
                    &["pool"],
                    registry
                )
                .unwrap(),
                all_pods_ready_latency: register_histogram_vec_with_registry!(
                    "sandboxctl_pool_all_pods_ready_latency_seconds",
                    "Time from scale-out event to all new pods Ready, per pool",
                    &["pool"],
                    registry
                )
                .unwrap(),
                container_start_latency: register_histogram_vec_with_registry!(
                    "sandboxctl_pool_container_start_latency_seconds",
                    "Per-container start latency, per pool and container",
                    &["pool", "container"],
                    registry
                )
                .unwrap(),
                image_pull_errors: register_int_counter_vec_with_registry!(
                    "sandboxctl_pool_image_pull_errors_total",
                    "Image pull failures, per pool and reason",
                    &["pool", "reason"],
                    registry
                )
                .unwrap(),
                pod_deletes: register_int_counter_vec_with_registry!(
                    "sandboxctl_pool_pod_deletes_total",
                    "Pod deletions, per pool and reason",
                    &["pool", "reason"],
                    registry
                )
                .unwrap(),
                sandbox_ready_latency: register_histogram_vec_with_registry!(
                    "sandboxctl_sandbox_ready_latency_seconds",
                    "Sandbox create to Ready, per pool",
                    &["pool"],
                    registry
                )
                .unwrap(),
                idle_duration: register_histogram_vec_with_registry!(
                    "sandboxctl_sandbox_idle_duration_seconds",
                    "Idle duration of a pod before bind, on deletion, per pool",
                    &["pool"],
                    registry
                )
                .unwrap(),
                no_idle_pods: register_int_counter_vec_with_registry!(
                    "sandboxctl_sandbox_no_idle_pods_total",
                    "Count of binds that found zero idle pods, per pool",
                    &["pool"],
                    registry
                )
                .unwrap(),
            }
        }
    }

    static METRICS: OnceLock<ControllerMetrics> = OnceLock::new();

    pub fn global() -> &'static ControllerMetrics {
        METRICS.get_or_init(ControllerMetrics::new)
    }
}

#[cfg(feature = "metrics")]
pub use imp::{ControllerMetrics, global};

/// Render the current registry in Prometheus text exposition format.
/// Shared by the standalone metrics listener below and the gateway's own
/// `/metrics` route, so a process running both never disagrees with
/// itself about what's currently registered.
#[cfg(feature = "metrics")]
pub fn encode() -> Vec<u8> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = global().registry.gather();
    let mut buffer = Vec::new();
    let _ = encoder.encode(&metric_families, &mut buffer);
    buffer
}

#[cfg(not(feature = "metrics"))]
pub fn encode() -> Vec<u8> {
    Vec::new()
}

/// Serve the `/metrics` Prometheus exposition endpoint on its own listener,
/// matching spec.md §6.2's `/metrics` route (run on a separate port from
/// the gateway's own HTTP surface so controller processes that don't run
/// the gateway still expose metrics).
#[cfg(feature = "metrics")]
pub async fn serve(bind_addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use prometheus::Encoder;
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = service_fn(|_req: Request<hyper::body::Incoming>| async {
                Ok::<_, std::convert::Infallible>(Response::new(Full::new(Bytes::from(encode()))))
            });

            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(error = %err, "metrics connection error");
            }
        });
    }
}

#[cfg(not(feature = "metrics"))]
pub async fn serve(_bind_addr: &str) -> anyhow::Result<()> {
    tracing::info!("metrics feature disabled, not starting metrics server");
    std::future::pending().await
}
