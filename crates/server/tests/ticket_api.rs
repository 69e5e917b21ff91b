//! Ticket API tests driven through the in-process router.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use common::TestFixture;
use ticketdesk_core::testing::ChatCall;

#[tokio::test]
async fn test_list_and_count_go_through_the_bus() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/tickets").await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body, json!([]));

    fixture.open_ticket("U1", "first").await;
    fixture.open_ticket("U2", "second").await;

    let response = fixture.get("/api/v1/tickets").await;
    assert_status!(response, StatusCode::OK);
    let tickets = response.body.as_array().unwrap();
    assert_eq!(tickets.len(), 2);
    assert_eq!(tickets[0]["type"], "Pomoc");
    assert_eq!(tickets[1]["ticketNumber"], 2);

    let response = fixture.get("/api/v1/tickets/count").await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body, json!({ "count": 2 }));
}

#[tokio::test]
async fn test_get_ticket() {
    let fixture = TestFixture::new().await;
    let id = fixture.open_ticket("U1", "need help").await;

    let response = fixture.get(&format!("/api/v1/tickets/{}", id)).await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["id"], id);
    assert_eq!(response.body["userId"], "U1");
    assert_eq!(response.body["status"], 2);

    let response = fixture.get("/api/v1/tickets/9999").await;
    assert_status!(response, StatusCode::NOT_FOUND);
    assert!(response.body["error"].is_string());
}

#[tokio::test]
async fn test_claim_then_close() {
    let fixture = TestFixture::new().await;
    let id = fixture.open_ticket("U1", "need help").await;

    let response = fixture
        .post(
            &format!("/api/v1/tickets/{}/claim", id),
            json!({ "userId": "S1" }),
        )
        .await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["message"], "Ticket claimed");
    assert_eq!(response.body["ticket"]["status"], 1);
    assert_eq!(response.body["ticket"]["claimedBy"], "S1");

    let response = fixture
        .post(
            &format!("/api/v1/tickets/{}/claim", id),
            json!({ "userId": "S2" }),
        )
        .await;
    assert_status!(response, StatusCode::CONFLICT);

    let response = fixture
        .post(
            &format!("/api/v1/tickets/{}/close", id),
            json!({ "userId": "S2", "reason": "resolved" }),
        )
        .await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["ticket"]["status"], 0);
    assert_eq!(response.body["ticket"]["closedBy"], "S2");
    assert_eq!(response.body["ticket"]["closingReason"], "resolved");

    let response = fixture
        .post(
            &format!("/api/v1/tickets/{}/close", id),
            json!({ "userId": "S1", "reason": "again" }),
        )
        .await;
    assert_status!(response, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_close_without_reason_is_bad_request() {
    let fixture = TestFixture::new().await;
    let id = fixture.open_ticket("U1", "x").await;

    let response = fixture
        .post(
            &format!("/api/v1/tickets/{}/close", id),
            json!({ "userId": "S1" }),
        )
        .await;
    assert_status!(response, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_reply_is_stored_and_delivered() {
    let fixture = TestFixture::new().await;
    let id = fixture.open_ticket("U1", "x").await;
    fixture.chat.clear();

    let response = fixture
        .post(
            &format!("/api/v1/tickets/{}/reply", id),
            json!({ "reply": "On it", "authorId": "S1", "authorTag": "staff#1" }),
        )
        .await;
    assert_status!(response, StatusCode::OK);
    let messages = response.body["ticket"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["authorTag"], "staff#1");
    assert_eq!(messages[0]["content"], "On it");

    // Delivery runs on a spawned task.
    let mut delivered = Vec::new();
    for _ in 0..50 {
        delivered = fixture.chat.calls_to("send_message");
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        delivered,
        vec![ChatCall::SendMessage {
            channel_id: "chan-1".to_string(),
            text: "On it".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_empty_reply_is_rejected() {
    let fixture = TestFixture::new().await;
    let id = fixture.open_ticket("U1", "x").await;

    let response = fixture
        .post(
            &format!("/api/v1/tickets/{}/reply", id),
            json!({ "reply": "" }),
        )
        .await;
    assert_status!(response, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["error"], "Reply content is required");
}

#[tokio::test]
async fn test_delete_ticket() {
    let fixture = TestFixture::new().await;
    let id = fixture.open_ticket("U1", "x").await;

    let response = fixture.delete(&format!("/api/v1/tickets/{}", id)).await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["message"], "Ticket deleted");
    assert!(fixture.chat.calls().contains(&ChatCall::DeleteChannel {
        channel_id: "chan-1".to_string(),
    }));

    let response = fixture.delete(&format!("/api/v1/tickets/{}", id)).await;
    assert_status!(response, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let fixture = TestFixture::new().await;
    let id = fixture.open_ticket("U1", "x").await;

    let response = fixture
        .post_raw(&format!("/api/v1/tickets/{}/claim", id), "{not json")
        .await;
    assert!(response.status.is_client_error());
}

#[tokio::test]
async fn test_health_and_metrics() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/health").await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["storage"], "embedded_sql");

    fixture.open_ticket("U1", "x").await;
    let text = fixture.get_text("/metrics").await;
    assert!(text.contains("ticketdesk_tickets_by_status"));
    assert!(text.contains("ticketdesk_http_requests_total"));
}
