//! Logging and metrics exposition.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use prometheus_client::{encoding::text::encode, registry::Registry};
use tracing::{error, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a JSON logger filtered at `level`.
pub fn init(level: Level) {
    // Create fmt layer for logging
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_line_number(true)
        .with_thread_ids(true)
        .with_file(true);

    // Create a filter layer to set the maximum level
    let filter = tracing_subscriber::EnvFilter::new(level.to_string());

    // Set the global subscriber
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// Encode `registry` in the Prometheus text format.
pub fn render(registry: &Registry) -> Response {
    let mut buffer = String::new();
    if let Err(err) = encode(&mut buffer, registry) {
        error!(?err, "failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}
