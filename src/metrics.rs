//! Prometheus metrics.

use axum::{body::Body, http::Request, response::Response};
use lazy_static::lazy_static;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};
use tracing::Span;

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Simple request counter
    pub static ref INCOMING_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("incoming_requests", "The number of HTTP requests received"),
        &["http_method"]
    ).unwrap();
    // Request counter by status code
    pub static ref RESPONSE_CODE_COLLECTOR: IntCounterVec = IntCounterVec::new(
        Opts::new("outgoing_response", "The number of responses sent."),
        &["status_code"]
    ).unwrap();
    // Request histogram by response time
    pub static ref RESPONSE_TIME_COLLECTOR: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("response_time", "The time taken to respond to each request"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
        },
        &[],
    ).unwrap();
    // Metadata cache lookups by result (hit or miss)
    pub static ref METADATA_CACHE_LOOKUPS: IntCounterVec = IntCounterVec::new(
        Opts::new("metadata_cache_lookups", "The number of dataset metadata cache lookups"),
        &["result"]
    ).unwrap();
    // Metadata cache evictions after failed loads
    pub static ref METADATA_CACHE_EVICTIONS: IntCounter = IntCounter::new(
        "metadata_cache_evictions",
        "The number of dataset metadata cache entries evicted"
    ).unwrap();
    // Data portal lookups by outcome
    pub static ref PORTAL_LOOKUPS: IntCounterVec = IntCounterVec::new(
        Opts::new("portal_lookups", "The number of data portal dataset lookups"),
        &["outcome"]
    ).unwrap();
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(INCOMING_REQUESTS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_CODE_COLLECTOR.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_TIME_COLLECTOR.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(METADATA_CACHE_LOOKUPS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(METADATA_CACHE_EVICTIONS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PORTAL_LOOKUPS.clone()))
        .unwrap();
}

pub async fn metrics_handler() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    encoder.encode(&REGISTRY.gather(), &mut buffer).unwrap();

    String::from_utf8(buffer).unwrap()
}

/// Increments the prometheus counter on all incoming requests, labelled by http method
pub fn request_counter(request: &Request<Body>, _span: &Span) {
    INCOMING_REQUESTS
        .with_label_values(&[&request.method().to_string().to_ascii_uppercase()])
        .inc();
}

/// Increment the prometheus counter on all outgoing responses, labelled by status code
pub fn record_response_metrics<B>(
    response: &Response<B>,
    latency: std::time::Duration,
    _span: &Span,
) {
    RESPONSE_CODE_COLLECTOR
        .with_label_values(&[response.status().as_str()])
        .inc();

    RESPONSE_TIME_COLLECTOR
        .with_label_values(&[])
        .observe(latency.as_secs_f64());
}

/// Count a metadata cache lookup
pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    METADATA_CACHE_LOOKUPS.with_label_values(&[result]).inc();
}

pub fn record_cache_eviction() {
    METADATA_CACHE_EVICTIONS.inc();
}

/// Count a data portal lookup, labelled by outcome
pub fn record_portal_lookup(outcome: &str) {
    PORTAL_LOOKUPS.with_label_values(&[outcome]).inc();
}
