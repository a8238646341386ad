use std::sync::OnceLock;

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static WEBHOOK_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
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

fn reconciles_total() -> &'static IntCounterVec {
    RECONCILES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "foundry_controller_reconciles_total",
                    "Reconciliation count.",
                ),
                &["controller", "outcome"],
            )
            .expect("create foundry_controller_reconciles_total"),
        )
    })
}

fn webhook_calls_total() -> &'static IntCounterVec {
    WEBHOOK_CALLS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "foundry_controller_webhook_calls_total",
                    "Order webhook call count.",
                ),
                &["event", "outcome"],
            )
            .expect("create foundry_controller_webhook_calls_total"),
        )
    })
}

fn notifications_dropped() -> &'static IntGauge {
    NOTIFICATIONS_DROPPED.get_or_init(|| {
        register_collector(
            IntGauge::new(
                "foundry_controller_notifications_dropped",
                "Change notifications dropped for slow subscribers.",
            )
            .expect("create foundry_controller_notifications_dropped"),
        )
    })
}

pub fn observe_reconcile(controller: &str, outcome: &str) {
    reconciles_total()
        .with_label_values(&[controller, outcome])
        .inc();
}

pub fn observe_webhook_call(event: &str, outcome: &str) {
    webhook_calls_total()
        .with_label_values(&[event, outcome])
        .inc();
}

pub fn set_notifications_dropped(value: u64) {
    notifications_dropped().set(value as i64);
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = reconciles_total();
    let _ = webhook_calls_total();
    let _ = notifications_dropped();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
