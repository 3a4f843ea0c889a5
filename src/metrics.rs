//! Prometheus recorder. All metrics live in the global default registry
//! and are scraped from `GET /metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec,
    Encoder, HistogramVec, IntGauge, TextEncoder,
};

static DECISIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!("authzd_decisions_total", "Authorization decisions by outcome"),
        &["decision", "cached"]
    )
    .expect("failed to register authzd_decisions_total")
});

static DECISION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        prometheus::histogram_opts!(
            "authzd_decision_duration_seconds",
            "Decision latency in seconds",
            // Sub-10ms hot path: buckets from 100µs to 250ms
            vec![0.0001, 0.0005, 0.001, 0.002, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25]
        ),
        &["cached"]
    )
    .expect("failed to register authzd_decision_duration_seconds")
});

static AUTH_FAILURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!("authzd_auth_failures_total", "Credential failures by kind"),
        &["kind"]
    )
    .expect("failed to register authzd_auth_failures_total")
});

static RATE_LIMITED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!("authzd_rate_limited_total", "Requests rejected by the rate limiter"),
        &["principal_type"]
    )
    .expect("failed to register authzd_rate_limited_total")
});

static AUDIT_DROPPED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "authzd_audit_dropped_records",
        "Audit records shed on queue overflow"
    )
    .expect("failed to register authzd_audit_dropped_records")
});

pub fn record_decision(decision: &str, cached: bool, seconds: f64) {
    let cached = if cached { "true" } else { "false" };
    DECISIONS_TOTAL.with_label_values(&[decision, cached]).inc();
    DECISION_DURATION.with_label_values(&[cached]).observe(seconds);
}

pub fn record_auth_failure(kind: &str) {
    AUTH_FAILURES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_rate_limited(principal_type: &str) {
    RATE_LIMITED_TOTAL.with_label_values(&[principal_type]).inc();
}

pub fn set_audit_dropped(count: u64) {
    AUDIT_DROPPED.set(count as i64);
}

/// Encode all registered metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}
