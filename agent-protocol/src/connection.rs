//! Bidirectional JSON-RPC 2.0 connection (§4.3): correlates outgoing requests
//! with responses via a pending-awaiter map, dispatches incoming requests and
//! notifications to registered handlers, and applies per-request timeouts.
//!
//! The connection does not own the transport; it holds a non-owning `Arc`
//! handle plus the subscription loop that reads the transport's message
//! stream, mirroring the ownership split in §9 ("Connection holds a
//! non-owning handle to the transport but owns the subscription and pending
//! map").

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Error, JsonRpcError, Result};
use crate::jsonrpc::{classify, Envelope, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::Transport;

/// Handles one incoming JSON-RPC request for a registered method.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>) -> std::result::Result<Value, JsonRpcError>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Option<Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::result::Result<Value, JsonRpcError>> + Send,
{
    async fn handle(&self, params: Option<Value>) -> std::result::Result<Value, JsonRpcError> {
        (self)(params).await
    }
}

/// Handles one incoming JSON-RPC notification.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>) -> Result<()>;
}

#[async_trait]
impl<F, Fut> NotificationHandler for F
where
    F: Fn(Option<Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn handle(&self, params: Option<Value>) -> Result<()> {
        (self)(params).await
    }
}

pub trait ErrorCallback: Fn(Error) + Send + Sync {}
impl<F: Fn(Error) + Send + Sync> ErrorCallback for F {}

pub trait CloseCallback: Fn() + Send + Sync {}
impl<F: Fn() + Send + Sync> CloseCallback for F {}

struct PendingEntry {
    method: String,
    responder: oneshot::Sender<std::result::Result<Value, JsonRpcError>>,
}

/// The bidirectional connection. Create with [`Connection::new`], which
/// spawns the message loop; register handlers before traffic starts arriving
/// to avoid races on the handler maps (the maps themselves are safe to
/// mutate concurrently, but a request that arrives before its handler is
/// registered will be answered "method not found").
pub struct Connection {
    transport: Arc<dyn Transport>,
    pending: DashMap<String, PendingEntry>,
    request_handlers: DashMap<String, Arc<dyn RequestHandler>>,
    notification_handlers: DashMap<String, Arc<dyn NotificationHandler>>,
    catch_all_notification: Mutex<Option<Arc<dyn NotificationHandler>>>,
    on_error: Mutex<Option<Arc<dyn ErrorCallback>>>,
    on_close: Mutex<Option<Arc<dyn CloseCallback>>>,
    closed: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let conn = Arc::new(Self {
            transport,
            pending: DashMap::new(),
            request_handlers: DashMap::new(),
            notification_handlers: DashMap::new(),
            catch_all_notification: Mutex::new(None),
            on_error: Mutex::new(None),
            on_close: Mutex::new(None),
            closed: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
        });

        let loop_conn = conn.clone();
        let handle = tokio::spawn(async move {
            loop_conn.message_loop().await;
        });
        // best-effort: store the handle so Drop/close could abort it; a
        // blocking_lock is safe here since nothing else holds the mutex yet.
        if let Ok(mut guard) = conn.loop_handle.try_lock() {
            *guard = Some(handle);
        }

        conn
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn register_request_handler(&self, method: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.request_handlers.insert(method.into(), handler);
    }

    pub async fn register_notification_handler(&self, method: impl Into<String>, handler: Arc<dyn NotificationHandler>) {
        self.notification_handlers.insert(method.into(), handler);
    }

    pub async fn set_catch_all_notification_handler(&self, handler: Arc<dyn NotificationHandler>) {
        *self.catch_all_notification.lock().await = Some(handler);
    }

    pub async fn set_error_callback(&self, cb: Arc<dyn ErrorCallback>) {
        *self.on_error.lock().await = Some(cb);
    }

    pub async fn set_close_callback(&self, cb: Arc<dyn CloseCallback>) {
        *self.on_close.lock().await = Some(cb);
    }

    async fn report_error(&self, err: Error) {
        if let Some(cb) = self.on_error.lock().await.as_ref() {
            cb(err);
        } else {
            tracing::warn!(error = %err, "unhandled connection error");
        }
    }

    /// Send a request and await its response, subject to `timeout`.
    pub async fn send_request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::state(format!("connection is closed, cannot send '{method}'")));
        }

        let request = JsonRpcRequest::new(method, params);
        let id = request
            .id
            .as_str()
            .map(|s| s.to_string())
            .unwrap_or_else(|| request.id.to_string());

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), PendingEntry { method: method.to_string(), responder: tx });

        let payload = serde_json::to_value(&request)?;
        if let Err(e) = self.transport.send(payload).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(jsonrpc_err))) => Err(Error::JsonRpc(jsonrpc_err)),
            Ok(Err(_canceled)) => Err(Error::state(format!("connection closed while awaiting '{method}'"))),
            Err(_elapsed) => {
                self.pending.remove(&id);
                Err(Error::timeout(method, timeout))
            }
        }
    }

    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::state(format!("connection is closed, cannot send '{method}'")));
        }
        let notification = JsonRpcNotification::new(method, params);
        let payload = serde_json::to_value(&notification)?;
        self.transport.send(payload).await
    }

    async fn message_loop(self: Arc<Self>) {
        loop {
            match self.transport.recv().await {
                Ok(Some(value)) => self.dispatch(value).await,
                Ok(None) => {
                    self.handle_unexpected_close().await;
                    break;
                }
                Err(e) => {
                    self.report_error(e).await;
                    self.handle_unexpected_close().await;
                    break;
                }
            }
        }
    }

    async fn dispatch(&self, value: Value) {
        match classify(value) {
            Envelope::Response(resp) => self.handle_response(resp),
            Envelope::Request(req) => self.handle_request(req).await,
            Envelope::Notification(n) => self.handle_notification(n).await,
            Envelope::Unrecognized(v) => {
                tracing::debug!(?v, "ignoring envelope matching no known JSON-RPC shape");
            }
        }
    }

    fn handle_response(&self, resp: JsonRpcResponse) {
        let id = resp.id.as_str().map(|s| s.to_string()).unwrap_or_else(|| resp.id.to_string());
        let Some((_, entry)) = self.pending.remove(&id) else {
            tracing::debug!(id, "dropping response for unknown or already-resolved id");
            return;
        };
        let outcome = match resp.error {
            Some(e) => Err(e),
            None => Ok(resp.result.unwrap_or(Value::Null)),
        };
        let _ = entry.responder.send(outcome);
    }

    async fn handle_request(&self, req: JsonRpcRequest) {
        let handler = self.request_handlers.get(&req.method).map(|h| h.clone());
        let response = match handler {
            None => JsonRpcResponse::failure(req.id.clone(), JsonRpcError::method_not_found(&req.method)),
            Some(handler) => match handler.handle(req.params).await {
                Ok(result) => JsonRpcResponse::success(req.id.clone(), result),
                Err(jsonrpc_err) => JsonRpcResponse::failure(req.id.clone(), jsonrpc_err),
            },
        };

        let payload = match serde_json::to_value(&response) {
            Ok(p) => p,
            Err(e) => {
                self.report_error(Error::from(e)).await;
                return;
            }
        };
        if let Err(e) = self.transport.send(payload).await {
            self.report_error(e).await;
        }
    }

    async fn handle_notification(&self, n: JsonRpcNotification) {
        if let Some(handler) = self.notification_handlers.get(&n.method).map(|h| h.clone()) {
            if let Err(e) = handler.handle(n.params.clone()).await {
                self.report_error(e).await;
            }
        }
        if let Some(catch_all) = self.catch_all_notification.lock().await.clone() {
            if let Err(e) = catch_all.handle(n.params).await {
                self.report_error(e).await;
            }
        }
    }

    async fn handle_unexpected_close(&self) {
        self.close_internal().await;
    }

    /// Idempotent close: latches, fails every outstanding awaiter, closes the
    /// transport, and fires the close callback exactly once.
    pub async fn close(&self) -> Result<()> {
        self.close_internal().await;
        self.transport.close().await
    }

    async fn close_internal(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.pending_drain() {
            let message = format!("connection closed while awaiting '{}'", entry.method);
            let _ = entry.responder.send(Err(JsonRpcError::internal(message)));
        }
        if let Some(handle) = self.loop_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(cb) = self.on_close.lock().await.as_ref() {
            cb();
        }
    }

    fn pending_drain(&self) -> Vec<PendingEntry> {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        keys.into_iter().filter_map(|k| self.pending.remove(&k).map(|(_, v)| v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn request_response_correlation_resolves_to_matching_result() {
        let (a, b) = ChannelTransport::channel_pair();
        let conn_a = Connection::new(Arc::new(a));
        let conn_b = Connection::new(Arc::new(b));

        conn_b
            .register_request_handler(
                "echo",
                Arc::new(|params: Option<Value>| async move { Ok(params.unwrap_or(Value::Null)) }),
            )
            .await;

        let result = conn_a
            .send_request("echo", Some(json!({"x": 1})), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn unknown_method_yields_method_not_found() {
        let (a, b) = ChannelTransport::channel_pair();
        let conn_a = Connection::new(Arc::new(a));
        let _conn_b = Connection::new(Arc::new(b));

        let err = conn_a.send_request("nope", None, Duration::from_secs(1)).await.unwrap_err();
        match err {
            Error::JsonRpc(e) => assert_eq!(e.code, -32601),
            other => panic!("expected JsonRpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn jsonrpc_error_code_is_forwarded_unchanged() {
        let (a, b) = ChannelTransport::channel_pair();
        let conn_a = Connection::new(Arc::new(a));
        let conn_b = Connection::new(Arc::new(b));

        conn_b
            .register_request_handler("fails", Arc::new(|_: Option<Value>| async move {
                Err(JsonRpcError::invalid_params("Invalid params: missing field"))
            }))
            .await;

        let err = conn_a.send_request("fails", None, Duration::from_secs(1)).await.unwrap_err();
        match err {
            Error::JsonRpc(e) => {
                assert_eq!(e.code, -32602);
                assert_eq!(e.message, "Invalid params: missing field");
            }
            other => panic!("expected JsonRpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_removes_awaiter_and_a_late_response_is_dropped() {
        let (a, b) = ChannelTransport::channel_pair();
        let conn_a = Connection::new(Arc::new(a));
        let _conn_b = Connection::new(Arc::new(b));

        // no handler registered on b at all, so the request will never be answered
        let err = conn_a.send_request("slow", None, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn bidirectional_round_trip_a_calls_b_which_calls_back_into_a() {
        let (a, b) = ChannelTransport::channel_pair();
        let conn_a = Connection::new(Arc::new(a));
        let conn_b = Connection::new(Arc::new(b));

        let conn_a_for_handler = conn_a.clone();
        conn_a
            .register_request_handler(
                "inner",
                Arc::new(move |_: Option<Value>| {
                    let _unused = &conn_a_for_handler;
                    async move { Ok(json!(42)) }
                }),
            )
            .await;

        let conn_a_callback = conn_a.clone();
        conn_b
            .register_request_handler("outer", Arc::new(move |_: Option<Value>| {
                let conn_a_callback = conn_a_callback.clone();
                async move {
                    // B's handler for A's request turns around and calls back into A.
                    let v = conn_a_callback
                        .send_request("inner", None, Duration::from_secs(1))
                        .await
                        .map_err(|e| JsonRpcError::internal(e.to_string()))?;
                    Ok(v)
                }
            }))
            .await;

        let result = conn_b.send_request("outer", None, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result, json!(42));
    }

    #[tokio::test]
    async fn notifications_reach_both_specific_and_catch_all_handlers() {
        let (a, b) = ChannelTransport::channel_pair();
        let conn_a = Connection::new(Arc::new(a));
        let conn_b = Connection::new(Arc::new(b));

        let specific_count = Arc::new(AtomicU32::new(0));
        let catch_all_count = Arc::new(AtomicU32::new(0));

        let sc = specific_count.clone();
        conn_b
            .register_notification_handler("ping.note", Arc::new(move |_: Option<Value>| {
                let sc = sc.clone();
                async move {
                    sc.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .await;

        let cc = catch_all_count.clone();
        conn_b
            .set_catch_all_notification_handler(Arc::new(move |_: Option<Value>| {
                let cc = cc.clone();
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .await;

        conn_a.send_notification("ping.note", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(specific_count.load(Ordering::SeqCst), 1);
        assert_eq!(catch_all_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closing_a_connection_fails_outstanding_awaiters_and_future_sends() {
        let (a, b) = ChannelTransport::channel_pair();
        let conn_a = Connection::new(Arc::new(a));
        let _conn_b = Connection::new(Arc::new(b));

        let pending = {
            let conn_a = conn_a.clone();
            tokio::spawn(async move { conn_a.send_request("never", None, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn_a.close().await.unwrap();

        let result = pending.await.unwrap();
        assert!(result.is_err());

        let send_err = conn_a.send_request("anything", None, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(send_err, Error::State { .. }));
    }
}
