use std::sync::Arc;
use std::time::Duration;

use ticketdesk_core::{Config, EventBus, SanitizedConfig, TicketDesk, TicketRepository};

/// Shared application state
pub struct AppState {
    config: Config,
    desk: Arc<TicketDesk>,
}

impl AppState {
    pub fn new(config: Config, desk: Arc<TicketDesk>) -> Self {
        Self { config, desk }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn desk(&self) -> &TicketDesk {
        self.desk.as_ref()
    }

    pub fn repository(&self) -> &TicketRepository {
        self.desk.repository()
    }

    pub fn bus(&self) -> &EventBus {
        self.desk.bus()
    }

    /// Timeout for bus round trips made on behalf of HTTP requests.
    pub fn bus_timeout(&self) -> Duration {
        Duration::from_millis(self.config.desk.bus_timeout_ms)
    }
}
