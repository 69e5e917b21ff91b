//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring the ticket desk server:
//! - HTTP request metrics (latency, counts, errors)
//! - Gateway events received from the chat relay
//! - Ticket counts by status (collected dynamically)

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use regex_lite::Regex;

use ticketdesk_core::TicketStatus;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "ticketdesk_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticketdesk_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "ticketdesk_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// Gateway Metrics
// =============================================================================

/// Events delivered by the chat relay.
pub static GATEWAY_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ticketdesk_gateway_events_total",
            "Chat events received from the relay",
        ),
        &["kind", "outcome"],
    )
    .unwrap()
});

// =============================================================================
// Ticket Metrics
// =============================================================================

/// Tickets by current status (collected dynamically).
pub static TICKETS_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "ticketdesk_tickets_by_status",
            "Current ticket count by status",
        ),
        &["status"],
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // Gateway
    registry
        .register(Box::new(GATEWAY_EVENTS.clone()))
        .unwrap();

    // Tickets
    registry
        .register(Box::new(TICKETS_BY_STATUS.clone()))
        .unwrap();

    // Core metrics (storage, lifecycle, bus, chat)
    for metric in ticketdesk_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Collect dynamic metrics from current application state.
///
/// Called before encoding so the status gauges reflect the store.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let Ok(tickets) = state.repository().list().await else {
        return;
    };
    for status in [
        TicketStatus::Unclaimed,
        TicketStatus::Claimed,
        TicketStatus::Closed,
    ] {
        let count = tickets.iter().filter(|t| t.status() == status).count();
        TICKETS_BY_STATUS
            .with_label_values(&[status.as_str()])
            .set(count as i64);
    }
}

static NUMERIC_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"/\d+(/|$)").unwrap());

/// Normalize a path for metric labels (replace ticket ids with placeholders).
pub fn normalize_path(path: &str) -> String {
    // Applied twice: adjacent numeric segments share the separating slash.
    let once = NUMERIC_SEGMENT.replace_all(path, "/{id}$1");
    NUMERIC_SEGMENT.replace_all(&once, "/{id}$1").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_numeric() {
        assert_eq!(normalize_path("/api/v1/tickets/42"), "/api/v1/tickets/{id}");
    }

    #[test]
    fn test_normalize_path_numeric_middle() {
        assert_eq!(
            normalize_path("/api/v1/tickets/42/claim"),
            "/api/v1/tickets/{id}/claim"
        );
    }

    #[test]
    fn test_normalize_path_no_ids() {
        assert_eq!(normalize_path("/api/v1/tickets/count"), "/api/v1/tickets/count");
    }

    #[test]
    fn test_encode_metrics_returns_prometheus_format() {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/test", "200"])
            .inc();

        let output = encode_metrics();
        assert!(output.contains("ticketdesk_http_requests_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_registry_contains_core_metrics() {
        TICKETS_BY_STATUS.with_label_values(&["unclaimed"]).set(0);
        GATEWAY_EVENTS.with_label_values(&["message", "ok"]).inc();
        ticketdesk_core::metrics::WRITE_QUEUE_DEPTH.set(0);
        ticketdesk_core::metrics::TICKETS_EVICTED.inc();

        let output = encode_metrics();
        assert!(output.contains("ticketdesk_tickets_by_status"));
        assert!(output.contains("ticketdesk_gateway_events_total"));
        assert!(output.contains("ticketdesk_write_queue_depth"));
        assert!(output.contains("ticketdesk_tickets_evicted_total"));
    }
}
