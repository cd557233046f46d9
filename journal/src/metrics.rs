//! Per-operation counters and latencies for the Prometheus endpoint.

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::future::Future;
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    pub static ref REQ_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("journal_requests", "journal operations"), &["method"]).unwrap();

    pub static ref ERR_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("journal_errors", "failed journal operations"), &["method"]).unwrap();

    /// Seconds per call.
    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("journal_method_cost", "journal operation cost"),
        &["method"]
    )
    .unwrap();
}

/// Safe to call more than once.
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ERR_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
}

/// Text exposition of everything registered.
pub fn gather_text() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY_INSTANCE.gather(), &mut buffer) {
        log::warn!("failed to encode metrics: {}", e);
    }
    buffer
}

/// Records metrics for an async operation
///
/// Counts the call, runs `handler` and observes how long it took. Failed
/// calls are also counted separately.
pub async fn record_metrics<F, Fut, T, E>(method_name: &'static str, handler: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    REQ_COUNTER_VEC.with_label_values(&[method_name]).inc();
    let result = handler().await;

    let elapsed = start.elapsed();
    METHOD_HISTOGRAM_VEC
        .with_label_values(&[method_name])
        .observe(elapsed.as_secs_f64());
    if result.is_err() {
        ERR_COUNTER_VEC.with_label_values(&[method_name]).inc();
    }

    result
}
