use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

use crate::error::ClientError;

lazy_static! {
    // Outbound API calls
    pub static ref CLIENT_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "client_requests_total",
        "Total number of requests sent to the quiz backend",
        &["endpoint", "outcome"]
    )
    .unwrap();

    pub static ref CLIENT_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "client_request_duration_seconds",
        "Quiz backend request duration in seconds",
        &["endpoint"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();

    // Session lifecycle
    pub static ref QUIZ_SESSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiz_sessions_total",
        "Quiz session lifecycle events",
        &["event"]
    )
    .unwrap();

    // Monetization
    pub static ref CHECKOUT_POLLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "checkout_polls_total",
        "Checkout status polls by result",
        &["result"]
    )
    .unwrap();

    pub static ref ACCESS_GRANTS_TOKENS_TOTAL: IntCounter = register_int_counter!(
        "access_grants_tokens_total",
        "Tokens granted locally after confirmed checkouts"
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: track a backend call with metrics
pub async fn track_request<F, T>(endpoint: &str, future: F) -> Result<T, ClientError>
where
    F: std::future::Future<Output = Result<T, ClientError>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let outcome = match &result {
        Ok(_) => "success",
        Err(ClientError::PaymentRequired { .. }) => "payment_required",
        Err(ClientError::Api { .. }) => "api_error",
        Err(ClientError::Transport(_)) => "transport_error",
        Err(_) => "client_error",
    };

    CLIENT_REQUESTS_TOTAL
        .with_label_values(&[endpoint, outcome])
        .inc();

    CLIENT_REQUEST_DURATION_SECONDS
        .with_label_values(&[endpoint])
        .observe(duration);

    result
}

pub fn record_session_event(event: &str) {
    QUIZ_SESSIONS_TOTAL.with_label_values(&[event]).inc();
}

pub fn record_checkout_poll(result: &str) {
    CHECKOUT_POLLS_TOTAL.with_label_values(&[result]).inc();
}
