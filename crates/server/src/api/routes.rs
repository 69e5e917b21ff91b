use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

use super::{gateway, handlers, middleware::metrics_middleware, tickets};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Frontend static files path (configurable via env)
    let frontend_dir =
        std::env::var("FRONTEND_DIR").unwrap_or_else(|_| "frontend/dist".to_string());

    // API routes
    let api_routes = Router::new()
        // Health and config
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        // Tickets
        .route("/tickets", get(tickets::list_tickets))
        .route("/tickets/count", get(tickets::count_tickets))
        .route(
            "/tickets/{id}",
            get(tickets::get_ticket).delete(tickets::delete_ticket),
        )
        .route("/tickets/{id}/claim", post(tickets::claim_ticket))
        .route("/tickets/{id}/close", post(tickets::close_ticket))
        .route("/tickets/{id}/reply", post(tickets::reply_ticket))
        // Chat relay ingress
        .route("/gateway/messages", post(gateway::message))
        .route("/gateway/interactions", post(gateway::interaction))
        .with_state(Arc::clone(&state));

    // Serve frontend with SPA fallback
    let index_path = format!("{}/index.html", frontend_dir);
    let serve_dir = ServeDir::new(&frontend_dir).fallback(ServeFile::new(&index_path));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::metrics).with_state(state))
        .fallback_service(serve_dir)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
