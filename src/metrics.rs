//! Prometheus counters for relayed faxes and the `/metrics` endpoint.

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Fax counters, registered with a private registry.
///
/// Cheap to clone; clones share the same counters.
#[derive(Clone)]
pub struct FaxMetrics {
    registry: Registry,
    pub received: IntCounter,
    pub sent: IntCounter,
    pub failed_received: IntCounter,
    pub failed_sent: IntCounter,
    pub forward_errors: IntCounter,
    pub unparsed_lines: IntCounter,
}

impl FaxMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let received = counter("faxrelay_received_total", "Received faxes seen in the log")?;
        let sent = counter("faxrelay_sent_total", "Sent faxes seen in the log")?;
        let failed_received = counter(
            "faxrelay_failed_received_total",
            "Received faxes with a non-OK reason",
        )?;
        let failed_sent = counter(
            "faxrelay_failed_sent_total",
            "Sent faxes with a non-OK reason",
        )?;
        let forward_errors = counter(
            "faxrelay_forward_errors_total",
            "Outbound sends that failed",
        )?;
        let unparsed_lines = counter(
            "faxrelay_unparsed_lines_total",
            "Log lines rejected by the grammar",
        )?;

        Ok(Self {
            registry,
            received,
            sent,
            failed_received,
            failed_sent,
            forward_errors,
            unparsed_lines,
        })
    }

    /// Text exposition format, as served on `/metrics`.
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output is not valid UTF-8")
    }
}

/// Bind the metrics listener. Failing to bind is a startup error.
///
/// Binding happens before the runtime starts so the error surfaces first.
pub fn bind(addr: &str) -> Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(addr)
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?;
    listener
        .set_nonblocking(true)
        .context("Failed to configure metrics listener")?;
    Ok(listener)
}

/// Serve `/metrics` until `shutdown` is cancelled.
pub async fn serve(
    listener: std::net::TcpListener,
    metrics: Arc<FaxMetrics>,
    shutdown: CancellationToken,
) -> Result<()> {
    let handler = move || {
        let metrics = Arc::clone(&metrics);
        async move {
            match metrics.encode_text() {
                Ok(body) => (
                    StatusCode::OK,
                    [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                    body,
                )
                    .into_response(),
                Err(e) => {
                    error!(error = %e, "Failed to encode metrics");
                    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
                }
            }
        }
    };

    let app = Router::new().route("/metrics", get(handler));
    let listener = TcpListener::from_std(listener).context("Failed to register metrics listener")?;

    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Metrics server listening");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Metrics server error")
}
