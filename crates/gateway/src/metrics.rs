use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static RPC_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RPC_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static NOTIFICATIONS_DROPPED: OnceLock<IntGauge> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn rpc_requests_total() -> &'static IntCounterVec {
    RPC_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("foundry_gateway_rpc_requests_total", "RPC request count."),
                &["method", "code"],
            )
            .expect("create foundry_gateway_rpc_requests_total"),
        )
    })
}

fn rpc_request_duration_seconds() -> &'static HistogramVec {
    RPC_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "foundry_gateway_rpc_request_duration_seconds",
                    "RPC request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["method", "outcome"],
            )
            .expect("create foundry_gateway_rpc_request_duration_seconds"),
        )
    })
}

fn notifications_dropped() -> &'static IntGauge {
    NOTIFICATIONS_DROPPED.get_or_init(|| {
        register_collector(
            IntGauge::new(
                "foundry_gateway_notifications_dropped",
                "Change notifications dropped for slow subscribers.",
            )
            .expect("create foundry_gateway_notifications_dropped"),
        )
    })
}

pub fn observe_rpc_request(method: &str, code: &str, duration: Duration) {
    rpc_requests_total().with_label_values(&[method, code]).inc();
    let outcome = if code == "OK" { "success" } else { "error" };
    rpc_request_duration_seconds()
        .with_label_values(&[method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn set_notifications_dropped(value: u64) {
    notifications_dropped().set(value as i64);
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = rpc_requests_total();
    let _ = notifications_dropped();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
