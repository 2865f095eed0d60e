//! Transport adapter
//!
//! Correlates outbound requests with inbound responses by id and fans
//! unsolicited messages out to type listeners. The adapter owns no socket:
//! outbound frames go to a channel drained by the connection driver, and the
//! driver feeds inbound frames and disconnects back in.
//!
//! On disconnect every registered listener, durable or single-shot, receives
//! a `Network("connection closed")` error exactly once. Single-shot listeners
//! are removed afterwards, so no request is left waiting for a response that
//! can no longer arrive.

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::module::ipc::protocol::{InboundMessage, MethodCall};
use crate::module::traits::ModuleError;

/// What a listener receives: the message `result`, or its error
pub type MessageResult = Result<Option<Value>, ModuleError>;

type DurableHandler = Arc<dyn Fn(MessageResult) + Send + Sync>;
type OnceHandler = Box<dyn FnOnce(MessageResult) + Send>;

/// Handle for removing a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum Filter {
    Type(String),
    Id(String),
}

enum Handler {
    Durable(DurableHandler),
    Once(OnceHandler),
}

struct Listener {
    id: ListenerId,
    filter: Filter,
    handler: Handler,
}

impl Listener {
    fn matches(&self, message: &InboundMessage) -> bool {
        match &self.filter {
            Filter::Type(t) => message.message_type.as_deref() == Some(t.as_str()),
            Filter::Id(id) => message.id.as_deref() == Some(id.as_str()),
        }
    }
}

enum Fired {
    Durable(DurableHandler),
    Once(OnceHandler),
}

impl Fired {
    fn invoke(self, result: MessageResult) {
        match self {
            Fired::Durable(handler) => handler(result),
            Fired::Once(handler) => handler(result),
        }
    }
}

/// Request/response correlation over a persistent connection
pub struct Transport {
    outbound: mpsc::UnboundedSender<String>,
    listeners: Mutex<Vec<Listener>>,
    next_listener: AtomicU64,
}

impl Transport {
    /// Create a transport and the receiver its connection driver drains
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            outbound,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        });
        (transport, rx)
    }

    /// Send `{method, args, id}` and wait for the matching response
    pub async fn request(&self, method: &str, args: Value) -> Result<Value, ModuleError> {
        let id = Uuid::new_v4().to_string();
        let frame = serde_json::to_string(&MethodCall {
            method: method.to_string(),
            args,
            id: id.clone(),
        })?;
        debug!(method, %id, "Sending request");
        self.round_trip(id, frame).await
    }

    /// Send `{type, id, ...fields}` and wait for the matching response
    pub async fn command(
        &self,
        message_type: &str,
        mut fields: Map<String, Value>,
    ) -> Result<Value, ModuleError> {
        let id = Uuid::new_v4().to_string();
        fields.insert("type".to_string(), Value::String(message_type.to_string()));
        fields.insert("id".to_string(), Value::String(id.clone()));
        let frame = serde_json::to_string(&Value::Object(fields))?;
        debug!(message_type, %id, "Sending command");
        self.round_trip(id, frame).await
    }

    async fn round_trip(&self, id: String, frame: String) -> Result<Value, ModuleError> {
        let (tx, rx) = oneshot::channel();
        let pending = PendingRequest {
            transport: self,
            listener: self.once_message_id(&id, move |result| {
                let _ = tx.send(result);
            }),
        };

        self.outbound
            .send(frame)
            .map_err(|_| ModuleError::Network("transport closed".to_string()))?;

        let result = rx
            .await
            .map_err(|_| ModuleError::Network("request abandoned".to_string()))?;
        drop(pending);
        result.map(|value| value.unwrap_or(Value::Null))
    }

    /// Durable listener for every message of `message_type`
    pub fn on_message_type<F>(&self, message_type: &str, handler: F) -> ListenerId
    where
        F: Fn(MessageResult) + Send + Sync + 'static,
    {
        self.register(
            Filter::Type(message_type.to_string()),
            Handler::Durable(Arc::new(handler)),
        )
    }

    /// Single-shot listener for the next message of `message_type`
    pub fn once_message_type<F>(&self, message_type: &str, handler: F) -> ListenerId
    where
        F: FnOnce(MessageResult) + Send + 'static,
    {
        self.register(
            Filter::Type(message_type.to_string()),
            Handler::Once(Box::new(handler)),
        )
    }

    /// Single-shot listener for the response carrying `id`
    pub fn once_message_id<F>(&self, id: &str, handler: F) -> ListenerId
    where
        F: FnOnce(MessageResult) + Send + 'static,
    {
        self.register(Filter::Id(id.to_string()), Handler::Once(Box::new(handler)))
    }

    /// Remove a listener; returns false if it already fired or was removed
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    /// Dispatch one inbound frame
    pub fn handle_message(&self, frame: &str) {
        let message: InboundMessage = match serde_json::from_str(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping unparseable message: {}", e);
                return;
            }
        };

        let fired = self.take_matching(|l| l.matches(&message));
        if fired.is_empty() {
            debug!(id = ?message.id, message_type = ?message.message_type, "No listener for message");
            return;
        }

        let result = message.outcome();
        for handler in fired {
            handler.invoke(result.clone());
        }
    }

    /// Broadcast the global connection error to every listener
    pub fn handle_disconnect(&self) {
        let fired = self.take_matching(|_| true);
        debug!(listeners = fired.len(), "Connection closed, failing listeners");
        let error = ModuleError::Network("connection closed".to_string());
        for handler in fired {
            handler.invoke(Err(error.clone()));
        }
    }

    fn register(&self, filter: Filter, handler: Handler) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners().push(Listener {
            id,
            filter,
            handler,
        });
        id
    }

    /// Collect handlers of matching listeners, removing single-shot ones.
    /// Handlers run after the lock is released so they may register or
    /// remove listeners themselves.
    fn take_matching(&self, matches: impl Fn(&Listener) -> bool) -> Vec<Fired> {
        let mut listeners = self.listeners();
        let mut fired = Vec::new();

        for listener in std::mem::take(&mut *listeners) {
            if !matches(&listener) {
                listeners.push(listener);
                continue;
            }
            let durable = match &listener.handler {
                Handler::Durable(handler) => Some(Arc::clone(handler)),
                Handler::Once(_) => None,
            };
            match durable {
                Some(handler) => {
                    fired.push(Fired::Durable(handler));
                    listeners.push(listener);
                }
                None => {
                    if let Handler::Once(handler) = listener.handler {
                        fired.push(Fired::Once(handler));
                    }
                }
            }
        }

        fired
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes an unanswered request's listener when the caller stops waiting
struct PendingRequest<'a> {
    transport: &'a Transport,
    listener: ListenerId,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.transport.remove_listener(self.listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn respond(transport: &Transport, request: &str, result: Value) {
        let sent: Value = serde_json::from_str(request).unwrap();
        let response = json!({ "id": sent["id"], "error": null, "result": result });
        transport.handle_message(&response.to_string());
    }

    #[tokio::test]
    async fn test_request_resolves_from_matching_response() {
        let (transport, mut outbound) = Transport::new();

        let requester = Arc::clone(&transport);
        let handle =
            tokio::spawn(async move { requester.request("listPlugins", json!({})).await });

        let frame = outbound.recv().await.unwrap();
        let sent: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(sent["method"], "listPlugins");

        // An unrelated response must not resolve the request
        transport.handle_message(r#"{"id":"someone-else","result":1}"#);
        respond(&transport, &frame, json!(["sky"]));

        assert_eq!(handle.await.unwrap(), Ok(json!(["sky"])));
        assert_eq!(transport.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_server_error_rejects_request() {
        let (transport, mut outbound) = Transport::new();
        let requester = Arc::clone(&transport);
        let mut fields = Map::new();
        fields.insert("plugin".to_string(), json!("sky"));
        let handle =
            tokio::spawn(async move { requester.command("removePlugin", fields).await });

        let frame = outbound.recv().await.unwrap();
        let sent: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(sent["type"], "removePlugin");
        assert_eq!(sent["plugin"], "sky");

        let response = json!({ "id": sent["id"], "error": "invalid plugin spec", "result": null });
        transport.handle_message(&response.to_string());

        assert_eq!(
            handle.await.unwrap(),
            Err(ModuleError::Remote("invalid plugin spec".to_string()))
        );
    }

    #[tokio::test]
    async fn test_disconnect_rejects_every_pending_request_once() {
        let (transport, mut outbound) = Transport::new();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let requester = Arc::clone(&transport);
                tokio::spawn(async move { requester.request("requestPlugins", json!({})).await })
            })
            .collect();
        for _ in 0..3 {
            outbound.recv().await.unwrap();
        }

        let durable_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&durable_calls);
        transport.on_message_type("add", move |result| {
            assert!(result.is_err());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        transport.handle_disconnect();

        for handle in handles {
            assert_eq!(
                handle.await.unwrap(),
                Err(ModuleError::Network("connection closed".to_string()))
            );
        }
        assert_eq!(durable_calls.load(Ordering::SeqCst), 1);
        // Only the durable listener survives
        assert_eq!(transport.listener_count(), 1);

        transport.handle_disconnect();
        assert_eq!(durable_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_type_listeners() {
        let (transport, _outbound) = Transport::new();
        let durable = Arc::new(AtomicUsize::new(0));
        let once = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&durable);
        let durable_id = transport.on_message_type("add", move |result| {
            assert_eq!(result, Ok(Some(json!({ "plugin": "sky" }))));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&once);
        transport.once_message_type("add", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let notification = r#"{"type":"add","result":{"plugin":"sky"}}"#;
        transport.handle_message(notification);
        transport.handle_message(notification);
        transport.handle_message(r#"{"type":"remove","result":{"plugin":"sky"}}"#);

        assert_eq!(durable.load(Ordering::SeqCst), 2);
        assert_eq!(once.load(Ordering::SeqCst), 1);

        assert!(transport.remove_listener(durable_id));
        assert!(!transport.remove_listener(durable_id));
        transport.handle_message(notification);
        assert_eq!(durable.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_request_removes_its_listener() {
        let (transport, _outbound) = Transport::new();
        let pending = transport.request("listPlugins", json!({}));
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(transport.listener_count(), 0);
    }
}
