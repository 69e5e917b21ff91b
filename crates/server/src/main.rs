use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ticketdesk_core::{
    create_backend, load_config, register_outbound_delivery, register_ticket_responders,
    validate_config, ChatClient, EventBus, RelayChatClient, TicketDesk, TicketRepository,
    WriteQueue,
};

use ticketdesk_server::api::create_router;
use ticketdesk_server::state::AppState;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Determine config path
    let config_path = std::env::var("TICKETDESK_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Load configuration
    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!("Storage backend: {}", config.storage.backend.as_str());
    info!("Intake channels: {}", config.desk.intake.len());

    // Open storage and start the write queue
    let backend = create_backend(&config.storage)
        .await
        .context("Failed to initialize storage backend")?;
    let queue = WriteQueue::spawn(Arc::clone(&backend), config.desk.queue_capacity);
    let repository = TicketRepository::new(backend, queue.clone());
    info!("Write queue started");

    // Chat relay client
    let chat: Arc<dyn ChatClient> = Arc::new(
        RelayChatClient::new(&config.chat).context("Failed to create chat relay client")?,
    );
    info!("Chat relay at {}", config.chat.relay_url);

    // Bus and lifecycle engine
    let bus = EventBus::new();
    register_ticket_responders(&bus, repository.clone());
    register_outbound_delivery(&bus, Arc::clone(&chat));

    let desk = Arc::new(TicketDesk::new(
        repository,
        chat,
        bus,
        config.desk.clone(),
    ));
    let loaded = desk.bootstrap().await;
    info!("Loaded {} tickets", loaded);

    // Create app state
    let state = Arc::new(AppState::new(config.clone(), desk));

    // Create router
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");
    info!("Draining {} pending writes", queue.pending());
    queue.shutdown().await;
    info!("Write queue stopped");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
