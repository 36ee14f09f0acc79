//! A single agent session (§4.5): owns its `sessionId`, liveness, the three
//! event-subscription flavors, the tool fallback chain, send/sendAndWait, and
//! idempotent destroy.
//!
//! The session does not own the connection -- it holds a non-owning `Arc`
//! shared with the client and every sibling session, mirroring the ownership
//! split documented on `Connection` itself.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;

use agent_protocol::connection::Connection;
use agent_protocol::error::{Error as ProtocolError, RetryPolicy};

use crate::config::SessionConfig;
use crate::event::SessionEvent;
use crate::tool::{ToolRegistry, ToolResult};

/// A callback invoked with every matching event. Registered handlers are
/// snapshotted before each dispatch so (un)registering concurrently with a
/// dispatch in progress never deadlocks or mutates a list mid-iteration.
pub type EventHandler = Arc<dyn Fn(SessionEvent) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    persistent: Vec<EventHandler>,
    typed: Vec<(String, EventHandler)>,
    once: Vec<EventHandler>,
}

#[derive(Debug, Clone)]
pub struct SessionError(pub String);

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SessionError {}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError(e.to_string())
    }
}

/// The aggregated result of a completed `sendAndWait` (§4.5 step 5).
#[derive(Debug, Clone, PartialEq)]
pub struct SendResult {
    pub content: String,
    pub message_id: String,
}

/// Invoked exactly once when a session finishes destroying (§4.4: "installs
/// an onDestroyed callback to remove it from the registry").
pub type DestroyedHandler = Arc<dyn Fn() + Send + Sync>;

type DestroyFuture = Shared<BoxFuture<'static, Result<(), SessionError>>>;

pub struct Session {
    session_id: String,
    connection: Arc<Connection>,
    config: SessionConfig,
    request_timeout: Duration,
    local_tools: RwLock<ToolRegistry>,
    config_tools: ToolRegistry,
    client_tools: ToolRegistry,
    destroyed: AtomicBool,
    handlers: Mutex<Handlers>,
    broadcast: Mutex<Option<broadcast::Sender<SessionEvent>>>,
    destroy_future: Mutex<Option<DestroyFuture>>,
    on_destroyed: Mutex<Option<DestroyedHandler>>,
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        connection: Arc<Connection>,
        config: SessionConfig,
        config_tools: ToolRegistry,
        client_tools: ToolRegistry,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.into(),
            connection,
            config,
            request_timeout,
            local_tools: RwLock::new(ToolRegistry::new()),
            config_tools,
            client_tools,
            destroyed: AtomicBool::new(false),
            handlers: Mutex::new(Handlers::default()),
            broadcast: Mutex::new(None),
            destroy_future: Mutex::new(None),
            on_destroyed: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Registers the callback invoked exactly once when this session finishes
    /// destroying. The client uses this to remove the session from its
    /// registry (§4.4) without the session itself knowing about the client.
    pub async fn set_on_destroyed(&self, handler: DestroyedHandler) {
        *self.on_destroyed.lock().await = Some(handler);
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.is_destroyed() {
            return Err(SessionError(format!("session '{}' has been destroyed", self.session_id)));
        }
        Ok(())
    }

    // -- tool dispatch: session-local -> session-config -> client-level --

    pub fn register_tool(&self, name: impl Into<String>, handler: Arc<dyn crate::tool::ToolHandler>) {
        self.local_tools.write().register(name, handler);
    }

    pub async fn handle_tool_call(&self, name: &str, arguments: Value) -> ToolResult {
        let handler = self
            .local_tools.read().get(name)
            .or_else(|| self.config_tools.get(name))
            .or_else(|| self.client_tools.get(name));

        let Some(handler) = handler else {
            return ToolResult::failure(format!("Unknown tool: {name}"));
        };

        match handler.call(arguments).await {
            Ok(result) => result,
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }

    // -- event subscription --

    async fn broadcast_sender(&self) -> broadcast::Sender<SessionEvent> {
        let mut guard = self.broadcast.lock().await;
        if let Some(tx) = guard.as_ref() {
            return broadcast::Sender::clone(tx);
        }
        let (tx, _rx) = broadcast::channel(256);
        *guard = Some(tx.clone());
        tx
    }

    /// A stream of every event the session receives, created lazily on first
    /// use. Each call returns an independent receiver; none observe events
    /// sent before they subscribed.
    pub async fn subscribe(&self) -> BroadcastStream<SessionEvent> {
        let tx = self.broadcast_sender().await;
        BroadcastStream::new(tx.subscribe())
    }

    /// Invoked for every event, for the session's lifetime.
    pub async fn on_event(&self, handler: EventHandler) {
        self.handlers.lock().await.persistent.push(handler);
    }

    /// Invoked only for events whose discriminant matches `discriminant`.
    pub async fn on(&self, discriminant: impl Into<String>, handler: EventHandler) {
        self.handlers.lock().await.typed.push((discriminant.into(), handler));
    }

    /// Invoked exactly once, for the next event received, then discarded.
    pub async fn once(&self, handler: EventHandler) {
        self.handlers.lock().await.once.push(handler);
    }

    /// Fan out one event to every registered handler. Called by the client
    /// when routing a `session.event` notification addressed to this session.
    pub async fn dispatch_event(&self, event: SessionEvent) {
        if self.is_destroyed() {
            return;
        }
        if let Some(tx) = self.broadcast.lock().await.as_ref() {
            let _ = tx.send(event.clone());
        }

        let once = {
            let mut handlers = self.handlers.lock().await;
            let persistent = handlers.persistent.clone();
            let typed = handlers.typed.clone();
            let once = std::mem::take(&mut handlers.once);
            drop(handlers);

            for handler in &persistent {
                handler(event.clone());
            }
            for (discriminant, handler) in &typed {
                if discriminant == event.discriminant() {
                    handler(event.clone());
                }
            }
            once
        };
        for handler in once {
            handler(event.clone());
        }
    }

    // -- send / sendAndWait --

    /// Dispatch a user message to the agent without waiting for a reply.
    /// Returns the server-assigned `messageId` (§4.5).
    pub async fn send(&self, message: impl Into<String>) -> Result<String, SessionError> {
        self.ensure_live()?;
        let response = self
            .connection
            .send_request(
                "session.send",
                Some(json!({"sessionId": self.session_id, "prompt": message.into()})),
                self.request_timeout,
            )
            .await?;
        response
            .get("messageId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| SessionError("session.send response missing 'messageId'".to_string()))
    }

    /// Send a message and aggregate the assistant's reply until the session
    /// goes idle, concatenating `AssistantMessage`/`AssistantMessageDelta`
    /// content in arrival order. Resolves to `None` on timeout, and also on
    /// an idle with no assistant content observed (§4.5 step 5, §8).
    pub async fn send_and_wait(&self, message: impl Into<String>, timeout: Duration) -> Result<Option<SendResult>, SessionError> {
        self.ensure_live()?;
        let mut stream = self.subscribe().await;
        let message_id = self.send(message).await?;

        let aggregate = async {
            let mut buffer = String::new();
            loop {
                match tokio_stream::StreamExt::next(&mut stream).await {
                    Some(Ok(SessionEvent::AssistantMessage { content, .. })) => buffer.push_str(&content),
                    Some(Ok(SessionEvent::AssistantMessageDelta { delta_content, .. })) => buffer.push_str(&delta_content),
                    Some(Ok(SessionEvent::SessionIdle { .. })) | None => {
                        return Ok(if buffer.is_empty() {
                            None
                        } else {
                            Some(SendResult { content: buffer, message_id: message_id.clone() })
                        });
                    }
                    Some(Ok(SessionEvent::SessionError { message, .. })) => {
                        return Err(SessionError(format!("session error while waiting for reply: {message}")))
                    }
                    Some(Ok(_other)) => continue,
                    Some(Err(_lagged)) => continue,
                }
            }
        };

        match tokio::time::timeout(timeout, aggregate).await {
            Ok(result) => result,
            Err(_elapsed) => Ok(None),
        }
    }

    // -- destroy --

    /// Idempotent: concurrent callers share one in-flight destroy via a lazily
    /// created `Shared` future rather than racing separate `session.destroy`
    /// requests.
    pub async fn destroy(self: &Arc<Self>) -> Result<(), SessionError> {
        let fut = {
            let mut guard = self.destroy_future.lock().await;
            if let Some(existing) = guard.as_ref() {
                Shared::clone(existing)
            } else {
                let session = Arc::clone(self);
                let shared: DestroyFuture = async move { session.destroy_once().await }.boxed().shared();
                *guard = Some(shared.clone());
                shared
            }
        };
        fut.await
    }

    async fn destroy_once(&self) -> Result<(), SessionError> {
        let already_destroyed = self.destroyed.swap(true, Ordering::SeqCst);
        if already_destroyed {
            return Ok(());
        }
        let result = self
            .connection
            .send_request("session.destroy", Some(json!({"sessionId": self.session_id})), self.request_timeout)
            .await
            .map(|_| ())
            .map_err(SessionError::from);
        self.cleanup_local_state().await;
        result
    }

    /// Used by `Client::stop`'s bulk graceful teardown (§4.4), which retries
    /// the `session.destroy` RPC itself with backoff rather than sharing a
    /// single cached attempt the way the public `destroy()` future does.
    pub(crate) async fn destroy_with_retry(&self, policy: &RetryPolicy) -> Result<(), SessionError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut attempt = 1;
        let result = loop {
            match self
                .connection
                .send_request("session.destroy", Some(json!({"sessionId": self.session_id})), self.request_timeout)
                .await
            {
                Ok(_) => break Ok(()),
                Err(e) if policy.should_retry(attempt) => {
                    tracing::debug!(attempt, error = %e, session_id = %self.session_id, "session.destroy failed, retrying");
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(e) => break Err(SessionError::from(e)),
            }
        };
        self.cleanup_local_state().await;
        result
    }

    /// Local cleanup run exactly once regardless of the `session.destroy` RPC
    /// outcome: close the broadcast stream, clear every handler and local
    /// tool, and fire the `onDestroyed` callback (§4.5 "Destroy").
    async fn cleanup_local_state(&self) {
        *self.broadcast.lock().await = None;
        {
            let mut handlers = self.handlers.lock().await;
            handlers.persistent.clear();
            handlers.typed.clear();
            handlers.once.clear();
        }
        self.local_tools.write().clear();
        if let Some(handler) = self.on_destroyed.lock().await.take() {
            handler();
        }
    }

    /// Mark the session dead without a round trip, e.g. when the underlying
    /// connection has already gone away.
    pub fn handle_connection_close(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBase;
    use agent_protocol::transport::ChannelTransport;
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;

    fn test_event(discriminant: &str) -> SessionEvent {
        let base = EventBase { id: "e1".into(), timestamp: Utc::now(), parent_id: None, ephemeral: false };
        match discriminant {
            "session.idle" => SessionEvent::SessionIdle { base, data: Value::Null },
            other => panic!("unhandled test discriminant {other}"),
        }
    }

    fn delta_event(delta_content: &str) -> SessionEvent {
        let base = EventBase { id: "e1".into(), timestamp: Utc::now(), parent_id: None, ephemeral: false };
        SessionEvent::AssistantMessageDelta { base, delta_content: delta_content.to_string(), data: Value::Null }
    }

    fn make_session() -> Arc<Session> {
        let (a, _b) = ChannelTransport::channel_pair();
        let connection = Connection::new(Arc::new(a));
        Session::new("sess-1", connection, SessionConfig::new(), ToolRegistry::new(), ToolRegistry::new(), Duration::from_secs(1))
    }

    /// A session whose peer actually answers `session.destroy`, for tests
    /// that exercise the round trip rather than just local state.
    async fn make_connected_session() -> Arc<Session> {
        let (a, b) = ChannelTransport::channel_pair();
        let connection_a = Connection::new(Arc::new(a));
        let connection_b = Connection::new(Arc::new(b));
        connection_b
            .register_request_handler("session.destroy", Arc::new(|_: Option<Value>| async move { Ok(json!({})) }))
            .await;
        Session::new("sess-1", connection_a, SessionConfig::new(), ToolRegistry::new(), ToolRegistry::new(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn unknown_tool_yields_failure_result() {
        let session = make_session();
        let result = session.handle_tool_call("nope", Value::Null).await;
        match result {
            ToolResult::Failure { error, .. } => assert!(error.contains("nope")),
            other => panic!("expected Failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_tool_registration_takes_priority_over_client_tool() {
        let session = make_session();
        session.register_tool("greet", Arc::new(|_: Value| async move { Ok(ToolResult::success("local")) }));
        let result = session.handle_tool_call("greet", Value::Null).await;
        match result {
            ToolResult::Success(text) => assert_eq!(text, "local"),
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn persistent_handler_runs_for_every_dispatched_event() {
        let session = make_session();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        session.on_event(Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); })).await;

        session.dispatch_event(test_event("session.idle")).await;
        session.dispatch_event(test_event("session.idle")).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn once_handler_fires_exactly_once() {
        let session = make_session();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        session.once(Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); })).await;

        session.dispatch_event(test_event("session.idle")).await;
        session.dispatch_event(test_event("session.idle")).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn destroy_is_idempotent_across_concurrent_callers() {
        let session = make_connected_session().await;
        let a = session.clone();
        let b = session.clone();
        let (r1, r2) = tokio::join!(a.destroy(), b.destroy());
        assert!(r1.is_ok());
        assert!(r2.is_ok());
        assert!(session.is_destroyed());
    }

    #[tokio::test]
    async fn send_after_destroy_fails_fast() {
        let session = make_connected_session().await;
        session.destroy().await.unwrap();
        let err = session.send("hi").await.unwrap_err();
        assert!(err.0.contains("destroyed"));
    }

    /// A session whose peer also answers `session.send`, for tests that
    /// exercise `send`/`sendAndWait` round trips.
    async fn make_connected_session_with_send(message_id: &str) -> Arc<Session> {
        let (a, b) = ChannelTransport::channel_pair();
        let connection_a = Connection::new(Arc::new(a));
        let connection_b = Connection::new(Arc::new(b));
        let message_id = message_id.to_string();
        connection_b
            .register_request_handler("session.send", Arc::new(move |_: Option<Value>| {
                let message_id = message_id.clone();
                async move { Ok(json!({"messageId": message_id})) }
            }))
            .await;
        Session::new("sess-1", connection_a, SessionConfig::new(), ToolRegistry::new(), ToolRegistry::new(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn send_returns_server_assigned_message_id() {
        let session = make_connected_session_with_send("m-1").await;
        let message_id = session.send("hi").await.unwrap();
        assert_eq!(message_id, "m-1");
    }

    #[tokio::test]
    async fn send_and_wait_aggregates_deltas_and_returns_message_id() {
        let session = make_connected_session_with_send("m-1").await;
        let waiter = session.clone();
        let handle = tokio::spawn(async move { waiter.send_and_wait("hi", Duration::from_millis(500)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.dispatch_event(delta_event("Hello ")).await;
        session.dispatch_event(delta_event("World!")).await;
        session.dispatch_event(test_event("session.idle")).await;

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, Some(SendResult { content: "Hello World!".to_string(), message_id: "m-1".to_string() }));
    }

    #[tokio::test]
    async fn send_and_wait_resolves_to_none_on_idle_with_no_content() {
        let session = make_connected_session_with_send("m-1").await;
        let waiter = session.clone();
        let handle = tokio::spawn(async move { waiter.send_and_wait("hi", Duration::from_millis(500)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.dispatch_event(test_event("session.idle")).await;

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn destroy_invokes_on_destroyed_callback_exactly_once() {
        let session = make_connected_session().await;
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        session.set_on_destroyed(Arc::new(move || { c.fetch_add(1, Ordering::SeqCst); })).await;

        session.destroy().await.unwrap();
        session.destroy().await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_event_is_a_no_op_after_destroy() {
        let session = make_connected_session().await;
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        session.on_event(Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); })).await;

        session.destroy().await.unwrap();
        session.dispatch_event(test_event("session.idle")).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
