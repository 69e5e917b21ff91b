//! Common test utilities for API testing with mocks.
//!
//! This module provides a test fixture that creates an in-process server
//! over a temporary SQLite database and a mock chat client, so the HTTP API
//! and the gateway ingress can be driven without a relay.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use ticketdesk_core::{
    config::{Config, DeskConfig},
    register_outbound_delivery, register_ticket_responders,
    storage::SqliteBackend,
    testing::MockChatClient,
    EventBus, StorageBackend, TicketDesk, TicketRepository, WriteQueue,
};
use ticketdesk_server::state::AppState;

/// Re-export fixtures for test convenience
pub use ticketdesk_core::testing::fixtures;

pub const HELP_INTAKE: &str = "help-desk";

/// Test fixture for API testing with mock dependencies.
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_ticket_listing() {
///     let fixture = TestFixture::new().await;
///     let response = fixture.get("/api/v1/tickets").await;
///     assert_eq!(response.status, 200);
/// }
/// ```
pub struct TestFixture {
    /// The Axum router for testing
    pub router: Router,
    /// Mock chat client - inspect and fail outbound calls
    pub chat: Arc<MockChatClient>,
    pub repository: TicketRepository,
    pub bus: EventBus,
    /// Temporary directory for the test database
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    /// Create a new test fixture with one intake channel.
    pub async fn new() -> Self {
        Self::with_desk(fixtures::desk_config(&[(HELP_INTAKE, "Pomoc")])).await
    }

    /// Create a test fixture with custom desk configuration.
    pub async fn with_desk(desk_config: DeskConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let mut config = Config::default();
        config.storage.sqlite.path = db_path.clone();
        config.desk = desk_config.clone();

        let backend: Arc<dyn StorageBackend> =
            Arc::new(SqliteBackend::open(&db_path).expect("Failed to open database"));
        let queue = WriteQueue::spawn(Arc::clone(&backend), 32);
        let repository = TicketRepository::new(backend, queue);

        let chat = Arc::new(MockChatClient::new());
        let bus = EventBus::new();
        register_ticket_responders(&bus, repository.clone());
        register_outbound_delivery(&bus, chat.clone());

        let desk = Arc::new(TicketDesk::new(
            repository.clone(),
            chat.clone(),
            bus.clone(),
            desk_config,
        ));
        desk.bootstrap().await;

        let state = Arc::new(AppState::new(config, desk));
        let router = ticketdesk_server::api::create_router(state);

        Self {
            router,
            chat,
            repository,
            bus,
            temp_dir,
        }
    }

    /// Open a ticket through the gateway and return its id.
    pub async fn open_ticket(&self, user: &str, content: &str) -> i64 {
        let message = fixtures::message(HELP_INTAKE, user, content);
        let response = self
            .post(
                "/api/v1/gateway/messages",
                serde_json::to_value(&message).unwrap(),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{:?}", response.body);
        response.body["ticketId"]
            .as_i64()
            .expect("ticket id missing from response")
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// Send a GET request and return the raw body as text.
    pub async fn get_text(&self, path: &str) -> String {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a DELETE request.
    pub async fn delete(&self, path: &str) -> TestResponse {
        self.request("DELETE", path, None).await
    }

    /// Send a POST request with raw string body (for testing malformed JSON).
    pub async fn post_raw(&self, path: &str, body: &str) -> TestResponse {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    /// Send a request to the test server.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        self.send(request_builder.body(body).unwrap()).await
    }

    async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }
}

/// Helper to assert a response has expected status.
#[macro_export]
macro_rules! assert_status {
    ($response:expr, $status:expr) => {
        assert_eq!(
            $response.status, $status,
            "Expected status {:?}, got {:?}. Body: {}",
            $status,
            $response.status,
            serde_json::to_string_pretty(&$response.body).unwrap_or_default()
        );
    };
}
