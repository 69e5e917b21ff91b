//! In-process event bus with history replay and correlated request/response.
//!
//! Payloads are JSON values so the HTTP side and the chat side can exchange
//! data without sharing types. A request carries a correlation `id`; the
//! responder answers on `<event>:response:<id>` or `<event>:error:<id>`.

mod events;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::metrics::BUS_REQUESTS;

pub use events::{SendMessage, GET_TICKETS, SEND_MESSAGE};

/// Default timeout for [`EventBus::request`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    #[error("Request timed out for event {event} after {timeout_ms}ms")]
    Timeout { event: String, timeout_ms: u64 },

    #[error("Request for event {event} failed: {message}")]
    Remote { event: String, message: String },
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct BusState {
    listeners: HashMap<String, Vec<(SubscriptionId, Handler)>>,
    history: HashMap<String, Value>,
}

/// Publish/subscribe bus. Clone to share; clones see the same subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        // A panicking handler never runs under the lock, so poisoning only
        // means a panic elsewhere mid-update; the maps are still usable.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Subscribe to `event`. With `replay`, the handler is called right away
    /// with the last payload emitted for `event`, if there was one.
    pub fn on<F>(&self, event: &str, handler: F, replay: bool) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(handler);

        let last = {
            let mut state = self.lock();
            state
                .listeners
                .entry(event.to_string())
                .or_default()
                .push((id, Arc::clone(&handler)));
            if replay {
                state.history.get(event).cloned()
            } else {
                None
            }
        };

        if let Some(data) = last {
            handler(&data);
        }
        id
    }

    /// Unsubscribe. Returns whether the subscription existed.
    pub fn off(&self, event: &str, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let Some(handlers) = state.listeners.get_mut(event) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(sub, _)| *sub != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            state.listeners.remove(event);
        }
        removed
    }

    /// Record `data` as the latest payload for `event`, then call every
    /// current subscriber in subscription order.
    pub fn emit(&self, event: &str, data: Value) {
        let handlers: Vec<Handler> = {
            let mut state = self.lock();
            state.history.insert(event.to_string(), data.clone());
            state
                .listeners
                .get(event)
                .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };

        for handler in handlers {
            handler(&data);
        }
    }

    /// Last payload emitted for `event`.
    pub fn last(&self, event: &str) -> Option<Value> {
        self.lock().history.get(event).cloned()
    }

    fn forget(&self, events: &[&str]) {
        let mut state = self.lock();
        for event in events {
            state.history.remove(*event);
        }
    }

    /// Emit `event` with a fresh correlation id and wait for the matching
    /// response or error event.
    ///
    /// An object payload gets an `id` field added; any other payload is
    /// wrapped as `{"payload": data, "id": id}`.
    pub async fn request(
        &self,
        event: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let id = uuid::Uuid::new_v4().to_string();
        let response_event = format!("{}:response:{}", event, id);
        let error_event = format!("{}:error:{}", event, id);

        let (tx, rx) = oneshot::channel::<Result<Value, Value>>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        let on_response = {
            let tx = Arc::clone(&tx);
            self.on(
                &response_event,
                move |data| {
                    if let Some(tx) = tx.lock().ok().and_then(|mut slot| slot.take()) {
                        let _ = tx.send(Ok(data.clone()));
                    }
                },
                false,
            )
        };
        let on_error = {
            let tx = Arc::clone(&tx);
            self.on(
                &error_event,
                move |data| {
                    if let Some(tx) = tx.lock().ok().and_then(|mut slot| slot.take()) {
                        let _ = tx.send(Err(data.clone()));
                    }
                },
                false,
            )
        };

        let payload = match data {
            Value::Object(mut map) => {
                map.insert("id".to_string(), Value::String(id.clone()));
                Value::Object(map)
            }
            other => json!({ "payload": other, "id": id }),
        };
        self.emit(event, payload);

        let outcome = tokio::time::timeout(timeout, rx).await;

        self.off(&response_event, on_response);
        self.off(&error_event, on_error);
        self.forget(&[&response_event, &error_event]);

        let result = match outcome {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(error))) => Err(BusError::Remote {
                event: event.to_string(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
            }),
            // Sender dropped without answering: treat like no answer.
            Ok(Err(_)) | Err(_) => Err(BusError::Timeout {
                event: event.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        let label = match &result {
            Ok(_) => "ok",
            Err(BusError::Remote { .. }) => "error",
            Err(BusError::Timeout { .. }) => "timeout",
        };
        BUS_REQUESTS.with_label_values(&[event, label]).inc();
        if let Err(e) = &result {
            tracing::warn!(event, error = %e, "Bus request failed");
        }
        result
    }

    /// Answer the request carried by `request` (its `id` field).
    pub fn respond(&self, event: &str, request: &Value, data: Value) {
        match request_id(request) {
            Some(id) => self.emit(&format!("{}:response:{}", event, id), data),
            None => tracing::warn!(event, "Cannot respond to a request without an id"),
        }
    }

    /// Fail the request carried by `request` with `message`.
    pub fn respond_error(&self, event: &str, request: &Value, message: &str) {
        match request_id(request) {
            Some(id) => self.emit(
                &format!("{}:error:{}", event, id),
                json!({ "message": message }),
            ),
            None => tracing::warn!(event, "Cannot respond to a request without an id"),
        }
    }
}

/// Correlation id of a request payload.
pub fn request_id(request: &Value) -> Option<&str> {
    request.get("id").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_emit_calls_every_subscriber() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            bus.on(
                "ping",
                move |data| seen.lock().unwrap().push(format!("{}:{}", tag, data)),
                false,
            );
        }
        bus.emit("ping", json!(1));

        assert_eq!(*seen.lock().unwrap(), vec!["a:1", "b:1"]);
        assert_eq!(bus.last("ping"), Some(json!(1)));
    }

    #[test]
    fn test_replay_delivers_last_payload() {
        let bus = EventBus::new();
        bus.emit("status", json!("first"));
        bus.emit("status", json!("second"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on("status", move |d| sink.lock().unwrap().push(d.clone()), true);
        assert_eq!(*seen.lock().unwrap(), vec![json!("second")]);

        // Without replay nothing is delivered until the next emit.
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        bus.on(
            "status",
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_off_unsubscribes() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let id = bus.on(
            "tick",
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        bus.emit("tick", Value::Null);
        assert!(bus.off("tick", id));
        assert!(!bus.off("tick", id));
        bus.emit("tick", Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_gets_correlated_response() {
        let bus = EventBus::new();
        let responder = bus.clone();
        bus.on(
            "getTickets",
            move |req| responder.respond("getTickets", req, json!([{"id": 1}])),
            false,
        );

        let response = bus
            .request("getTickets", json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response, json!([{"id": 1}]));

        // The request payload carried the correlation id.
        let sent = bus.last("getTickets").unwrap();
        assert!(request_id(&sent).is_some());
    }

    #[tokio::test]
    async fn test_request_error_is_distinct_from_timeout() {
        let bus = EventBus::new();
        let responder = bus.clone();
        bus.on(
            "getTickets",
            move |req| responder.respond_error("getTickets", req, "database down"),
            false,
        );

        let err = bus
            .request("getTickets", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BusError::Remote {
                event: "getTickets".to_string(),
                message: "database down".to_string(),
            }
        );
    }

    #[test]
    fn test_request_times_out_without_responder() {
        let bus = EventBus::new();
        let err = tokio_test::block_on(bus.request("nobody", json!({}), Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { timeout_ms: 20, .. }));
    }

    #[tokio::test]
    async fn test_async_responder() {
        let bus = EventBus::new();
        let responder = bus.clone();
        bus.on(
            "slow",
            move |req| {
                let responder = responder.clone();
                let req = req.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    responder.respond("slow", &req, json!("done"));
                });
            },
            false,
        );

        let response = bus
            .request("slow", json!(null), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response, json!("done"));
    }

    #[tokio::test]
    async fn test_request_cleans_up_correlation_events() {
        let bus = EventBus::new();
        let responder = bus.clone();
        bus.on(
            "q",
            move |req| responder.respond("q", req, json!(true)),
            false,
        );
        bus.request("q", json!({}), Duration::from_secs(1))
            .await
            .unwrap();

        let state = bus.lock();
        assert!(state.listeners.keys().all(|k| k == "q"));
        assert!(state.history.keys().all(|k| k == "q"));
    }
}
