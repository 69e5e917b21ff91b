//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Storage (operations per backend, write queue depth)
//! - Ticket lifecycle (creations, evictions, transitions)
//! - Bus requests and chat side effects

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts};

use crate::storage::StorageError;

// =============================================================================
// Storage
// =============================================================================

/// Storage operations by backend, operation and result.
pub static STORAGE_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ticketdesk_storage_operations_total",
            "Total storage operations",
        ),
        &["backend", "operation", "result"], // result: "ok", "error"
    )
    .unwrap()
});

/// Jobs accepted by the write queue and not yet finished.
pub static WRITE_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "ticketdesk_write_queue_depth",
        "Write jobs waiting or running",
    )
    .unwrap()
});

/// Rows rewritten because their stored status disagreed with the derived one.
pub static STATUS_REPAIRS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "ticketdesk_status_repairs_total",
        "Ticket rows whose stale stored status was rewritten",
    )
    .unwrap()
});

// =============================================================================
// Lifecycle
// =============================================================================

/// Tickets opened by type.
pub static TICKETS_CREATED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticketdesk_tickets_created_total", "Total tickets opened"),
        &["type"],
    )
    .unwrap()
});

/// Tickets evicted by the retention cap.
pub static TICKETS_EVICTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "ticketdesk_tickets_evicted_total",
        "Tickets evicted to stay under the retention cap",
    )
    .unwrap()
});

/// Lifecycle transitions by operation and result.
pub static TICKET_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ticketdesk_ticket_transitions_total",
            "Claim/close/delete attempts",
        ),
        &["operation", "result"], // result: "ok", "rejected", "not_found", "error"
    )
    .unwrap()
});

// =============================================================================
// Bus and chat
// =============================================================================

/// Bus request/response round trips by result.
pub static BUS_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticketdesk_bus_requests_total", "Total bus requests"),
        &["event", "result"], // result: "ok", "error", "timeout"
    )
    .unwrap()
});

/// Failed best-effort chat calls by call.
pub static CHAT_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ticketdesk_chat_failures_total",
            "Failed outbound chat calls",
        ),
        &["call"],
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Count a storage operation outcome.
pub fn observe_storage<T>(backend: &str, operation: &str, result: &Result<T, StorageError>) {
    let outcome = if result.is_ok() { "ok" } else { "error" };
    STORAGE_OPERATIONS
        .with_label_values(&[backend, operation, outcome])
        .inc();
}

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Storage
        Box::new(STORAGE_OPERATIONS.clone()),
        Box::new(WRITE_QUEUE_DEPTH.clone()),
        Box::new(STATUS_REPAIRS.clone()),
        // Lifecycle
        Box::new(TICKETS_CREATED.clone()),
        Box::new(TICKETS_EVICTED.clone()),
        Box::new(TICKET_TRANSITIONS.clone()),
        // Bus and chat
        Box::new(BUS_REQUESTS.clone()),
        Box::new(CHAT_FAILURES.clone()),
    ]
}
