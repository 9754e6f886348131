use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use std::time::Instant;

pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "notify_service_http_requests_total",
        "HTTP requests received",
        &["method", "path", "status"]
    )
    .expect("metric registration")
});

pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "notify_service_http_request_duration_seconds",
        "HTTP request latency",
        &["method", "path"]
    )
    .expect("metric registration")
});

pub static EVENTS_CONSUMED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "notify_service_events_consumed_total",
        "Broker events consumed, by routing key and outcome",
        &["routing_key", "outcome"]
    )
    .expect("metric registration")
});

pub static LIVE_PUSH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "notify_service_live_push_total",
        "Live push attempts during fan-out, by outcome",
        &["outcome"]
    )
    .expect("metric registration")
});

pub static NOTIFICATIONS_PERSISTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "notify_service_notifications_persisted_total",
        "Notification records written"
    )
    .expect("metric registration")
});

pub static BACKLOG_REPLAYED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "notify_service_backlog_replayed_total",
        "Backlog records replayed to reconnecting sessions"
    )
    .expect("metric registration")
});

pub async fn track_http_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), path.as_str(), response.status().as_str()])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[method.as_str(), path.as_str()])
        .observe(start.elapsed().as_secs_f64());

    response
}

/// `GET /metrics` in Prometheus text exposition format.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
    }
    (
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_and_increment() {
        EVENTS_CONSUMED_TOTAL
            .with_label_values(&["add_submission", "processed"])
            .inc();
        BACKLOG_REPLAYED_TOTAL.inc();

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "notify_service_events_consumed_total"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "notify_service_backlog_replayed_total"));
    }
}
