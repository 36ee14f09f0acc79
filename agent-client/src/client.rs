//! The top-level SDK entry point (§4.4): transport lifecycle, the
//! `ping`/`protocolVersion` handshake, the client's four-state machine,
//! server→client callback routing, the session registry and the single-flight
//! metadata cache.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use agent_protocol::connection::Connection;
use agent_protocol::error::{Error as ProtocolError, JsonRpcError, JsonRpcErrorCode, RetryPolicy};
use agent_protocol::transport::Transport;

use crate::config::{ClientOptions, SessionConfig};
use crate::event::SessionEvent;
use crate::session::Session;
use crate::tool::{merge_tool_lists, ToolHandler, ToolRegistry, ToolResult};

const PROTOCOL_VERSION: i64 = 2;

#[derive(Debug, Clone)]
pub struct ClientError(pub String);

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError(e.to_string())
    }
}

/// The client's connection lifecycle state (§4.4). Valid transitions:
/// `Disconnected -> Connecting -> Connected`, and `Connecting -> Error ->
/// Disconnected` when the handshake fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

pub type StateListener = Arc<dyn Fn(ClientState) + Send + Sync>;

/// A user-supplied handler answering a `permission.request` from the agent.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn handle(&self, params: Value) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> PermissionHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, params: Value) -> anyhow::Result<Value> {
        (self)(params).await
    }
}

/// A user-supplied handler answering a `userInput.request` from the agent.
#[async_trait]
pub trait UserInputHandler: Send + Sync {
    async fn handle(&self, params: Value) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> UserInputHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, params: Value) -> anyhow::Result<Value> {
        (self)(params).await
    }
}

/// A user-supplied handler answering a `hooks.invoke` request. Returning
/// `None` yields the empty-object reply; `Some(v)` yields `{"output": v}`.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, params: Value) -> anyhow::Result<Option<Value>>;
}

#[async_trait]
impl<F, Fut> HookHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<Option<Value>>> + Send,
{
    async fn handle(&self, params: Value) -> anyhow::Result<Option<Value>> {
        (self)(params).await
    }
}

type TransportFactory = Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<Arc<dyn Transport>, ProtocolError>> + Send + Sync>;

enum TransportSource {
    /// Supplied by the caller; the client never recreates it, so auto-restart
    /// is a no-op regardless of `ClientOptions::auto_restart`.
    External(Arc<dyn Transport>),
    /// Built by the client itself via the factory; eligible for auto-restart.
    Owned(TransportFactory),
}

type CachedMetadata = Shared<BoxFuture<'static, Result<Value, String>>>;

/// The SDK entry point: one `Client` drives one agent process and owns every
/// session created against it.
pub struct Client {
    source: Mutex<TransportSource>,
    owns_transport: bool,
    options: ClientOptions,
    connection: RwLock<Option<Arc<Connection>>>,
    state: RwLock<ClientState>,
    state_listeners: Mutex<Vec<StateListener>>,
    sessions: DashMap<String, Arc<Session>>,
    tool_registry: RwLock<ToolRegistry>,
    metadata_cache: Mutex<std::collections::HashMap<String, CachedMetadata>>,
    force_stopping: AtomicBool,
    permission_handler: Mutex<Option<Arc<dyn PermissionHandler>>>,
    user_input_handler: Mutex<Option<Arc<dyn UserInputHandler>>>,
    hook_handler: Mutex<Option<Arc<dyn HookHandler>>>,
}

impl Client {
    /// Build a client around a transport the caller owns. Auto-restart never
    /// applies: there is no factory to rebuild it with.
    pub fn new(transport: Arc<dyn Transport>, options: ClientOptions) -> Arc<Self> {
        Self::build(TransportSource::External(transport), false, options)
    }

    /// Build a client that owns its transport lifecycle via `factory`,
    /// enabling `ClientOptions::auto_restart`.
    pub fn with_factory<F, Fut>(factory: F, options: ClientOptions) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<Arc<dyn Transport>, ProtocolError>> + Send + 'static,
    {
        let boxed: TransportFactory = Arc::new(move || factory().boxed());
        Self::build(TransportSource::Owned(boxed), true, options)
    }

    fn build(source: TransportSource, owns_transport: bool, options: ClientOptions) -> Arc<Self> {
        Arc::new(Self {
            source: Mutex::new(source),
            owns_transport,
            options,
            connection: RwLock::new(None),
            state: RwLock::new(ClientState::Disconnected),
            state_listeners: Mutex::new(Vec::new()),
            sessions: DashMap::new(),
            tool_registry: RwLock::new(ToolRegistry::new()),
            metadata_cache: Mutex::new(std::collections::HashMap::new()),
            force_stopping: AtomicBool::new(false),
            permission_handler: Mutex::new(None),
            user_input_handler: Mutex::new(None),
            hook_handler: Mutex::new(None),
        })
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    pub async fn on_state_change(&self, listener: StateListener) {
        self.state_listeners.lock().await.push(listener);
    }

    async fn set_state(&self, new_state: ClientState) {
        {
            let mut guard = self.state.write().await;
            if *guard == new_state {
                return;
            }
            *guard = new_state;
        }
        let listeners = self.state_listeners.lock().await.clone();
        for listener in listeners {
            listener(new_state);
        }
    }

    // -- client-level tool registry (tier 3 fallback) --

    pub async fn register_tool(&self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.tool_registry.write().await.register(name, handler);
    }

    pub async fn set_permission_handler(&self, handler: Arc<dyn PermissionHandler>) {
        *self.permission_handler.lock().await = Some(handler);
    }

    pub async fn set_user_input_handler(&self, handler: Arc<dyn UserInputHandler>) {
        *self.user_input_handler.lock().await = Some(handler);
    }

    pub async fn set_hook_handler(&self, handler: Arc<dyn HookHandler>) {
        *self.hook_handler.lock().await = Some(handler);
    }

    // -- lifecycle --

    /// Idempotent: a no-op if already `Connected`. Acquires (or rebuilds) the
    /// transport, performs the `ping` handshake, and rejects a response
    /// missing `protocolVersion` rather than assuming compatibility.
    pub async fn start(self: &Arc<Self>) -> Result<(), ClientError> {
        if matches!(self.state().await, ClientState::Connected) {
            return Ok(());
        }
        self.set_state(ClientState::Connecting).await;

        let result = self.start_inner().await;
        match &result {
            Ok(()) => self.set_state(ClientState::Connected).await,
            Err(_) => {
                self.set_state(ClientState::Error).await;
                self.set_state(ClientState::Disconnected).await;
            }
        }
        result
    }

    async fn start_inner(self: &Arc<Self>) -> Result<(), ClientError> {
        let transport = self.acquire_transport().await?;
        let connection = Connection::new(transport);
        self.register_server_handlers(&connection).await;

        let handshake = connection
            .send_request("ping", None, self.options.request_timeout)
            .await
            .map_err(|e| ClientError(format!("handshake failed: {e}")))?;

        let version = handshake.get("protocolVersion").and_then(|v| v.as_i64());
        match version {
            Some(v) if v == PROTOCOL_VERSION => {}
            Some(other) => {
                return Err(ClientError(format!(
                    "unsupported protocol version {other}, expected {PROTOCOL_VERSION}"
                )))
            }
            None => return Err(ClientError("handshake response missing 'protocolVersion'".to_string())),
        }

        *self.connection.write().await = Some(connection);
        Ok(())
    }

    async fn acquire_transport(&self) -> Result<Arc<dyn Transport>, ClientError> {
        match &*self.source.lock().await {
            TransportSource::External(t) => Ok(t.clone()),
            TransportSource::Owned(factory) => factory().await.map_err(ClientError::from),
        }
    }

    async fn register_server_handlers(self: &Arc<Self>, connection: &Arc<Connection>) {
        let client = Arc::clone(self);
        connection
            .register_request_handler("tool.call", Arc::new(move |params: Option<Value>| {
                let client = client.clone();
                async move { client.handle_tool_call_request(params).await }
            }))
            .await;

        let client = Arc::clone(self);
        connection
            .register_request_handler("permission.request", Arc::new(move |params: Option<Value>| {
                let client = client.clone();
                async move { client.handle_delegated_request(params, &client.permission_handler).await }
            }))
            .await;

        let client = Arc::clone(self);
        connection
            .register_request_handler("userInput.request", Arc::new(move |params: Option<Value>| {
                let client = client.clone();
                async move { client.handle_delegated_request(params, &client.user_input_handler).await }
            }))
            .await;

        let client = Arc::clone(self);
        connection
            .register_request_handler("hooks.invoke", Arc::new(move |params: Option<Value>| {
                let client = client.clone();
                async move { client.handle_hooks_invoke_request(params).await }
            }))
            .await;

        let client = Arc::clone(self);
        connection
            .register_notification_handler("session.event", Arc::new(move |params: Option<Value>| {
                let client = client.clone();
                async move { client.handle_session_event_notification(params).await }
            }))
            .await;

        let client = Arc::clone(self);
        connection
            .register_notification_handler("session.lifecycle", Arc::new(move |params: Option<Value>| {
                let client = client.clone();
                async move { client.handle_session_lifecycle_notification(params).await }
            }))
            .await;

        let client = Arc::clone(self);
        connection
            .set_close_callback(Arc::new(move || {
                client.on_connection_closed();
            }))
            .await;
    }

    async fn handle_tool_call_request(&self, params: Option<Value>) -> std::result::Result<Value, JsonRpcError> {
        let params = params.unwrap_or(Value::Null);
        let name = params
            .get("toolName")
            .and_then(|v| v.as_str())
            .ok_or_else(|| JsonRpcError::invalid_params("tool.call missing 'toolName'"))?;
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
        let session_id = params.get("sessionId").and_then(|v| v.as_str());

        let result = match session_id {
            Some(sid) => {
                let session = self
                    .sessions
                    .get(sid)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| JsonRpcError::new(JsonRpcErrorCode::InvalidRequest, format!("Unknown session: {sid}")))?;
                session.handle_tool_call(name, arguments).await
            }
            None => self.handle_client_level_tool_call(name, arguments).await,
        };

        Ok(json!({"result": result.to_json()}))
    }

    async fn handle_client_level_tool_call(&self, name: &str, arguments: Value) -> ToolResult {
        let handler = self.tool_registry.read().await.get(name);
        match handler {
            None => ToolResult::failure(format!("Unknown tool: {name}")),
            Some(handler) => match handler.call(arguments).await {
                Ok(result) => result,
                Err(e) => ToolResult::failure(e.to_string()),
            },
        }
    }

    async fn handle_delegated_request<H: ?Sized>(
        &self,
        params: Option<Value>,
        slot: &Mutex<Option<Arc<H>>>,
    ) -> std::result::Result<Value, JsonRpcError>
    where
        H: DelegatedHandler,
    {
        let handler = slot.lock().await.clone();
        let Some(handler) = handler else {
            return Err(JsonRpcError::internal("no handler registered for this request"));
        };
        handler
            .handle(params.unwrap_or(Value::Null))
            .await
            .map_err(|e| JsonRpcError::internal(e.to_string()))
    }

    async fn handle_hooks_invoke_request(&self, params: Option<Value>) -> std::result::Result<Value, JsonRpcError> {
        let handler = self.hook_handler.lock().await.clone();
        let Some(handler) = handler else {
            return Ok(json!({}));
        };
        match handler.handle(params.unwrap_or(Value::Null)).await {
            Ok(Some(output)) => Ok(json!({"output": output})),
            Ok(None) => Ok(json!({})),
            Err(e) => Err(JsonRpcError::internal(e.to_string())),
        }
    }

    async fn handle_session_event_notification(&self, params: Option<Value>) -> agent_protocol::error::Result<()> {
        let Some(params) = params else { return Ok(()) };
        let outer_session_id = params.get("sessionId").and_then(|v| v.as_str()).map(|s| s.to_string());
        let event_value = params.get("event").cloned().unwrap_or_else(|| params.clone());

        let event = match SessionEvent::parse(&event_value) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(%err, "dropping unparseable session event");
                return Ok(());
            }
        };

        // outer sessionId wins over one embedded in the event payload itself.
        let session_id = outer_session_id.or_else(|| match &event {
            SessionEvent::SessionStart { session_id, .. } => session_id.clone(),
            _ => None,
        });

        if let Some(sid) = session_id {
            match self.sessions.get(&sid) {
                Some(session) => session.dispatch_event(event).await,
                None => return Err(ProtocolError::state(format!("Unknown session: {sid}"))),
            }
        }
        Ok(())
    }

    async fn handle_session_lifecycle_notification(&self, params: Option<Value>) -> agent_protocol::error::Result<()> {
        let Some(params) = params else { return Ok(()) };
        let Some(sid) = params.get("sessionId").and_then(|v| v.as_str()) else { return Ok(()) };
        let status = params.get("status").and_then(|v| v.as_str()).unwrap_or("");
        if status == "ended" || status == "destroyed" {
            if let Some((_, session)) = self.sessions.remove(sid) {
                session.handle_connection_close();
            }
        }
        Ok(())
    }

    fn on_connection_closed(self: &Arc<Self>) {
        for entry in self.sessions.iter() {
            entry.value().handle_connection_close();
        }
        self.sessions.clear();
        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.set_state(ClientState::Disconnected).await;
            let was_forced = client.force_stopping.swap(false, Ordering::SeqCst);
            if was_forced || !client.owns_transport || !client.options.auto_restart {
                return;
            }
            if let Err(e) = client.start().await {
                tracing::warn!(error = %e, "auto-restart failed");
            }
        });
    }

    async fn connection_handle(self: &Arc<Self>) -> Result<Arc<Connection>, ClientError> {
        if let Some(conn) = self.connection.read().await.clone() {
            return Ok(conn);
        }
        if self.options.auto_start {
            self.start().await?;
            if let Some(conn) = self.connection.read().await.clone() {
                return Ok(conn);
            }
        }
        Err(ClientError("client is not connected".to_string()))
    }

    // -- sessions --

    /// Create a new session. `config_tool_handlers` supplies handlers for any
    /// tool named in `config.tools` (the session-config fallback tier);
    /// handlers registered later via `Session::register_tool` take priority.
    pub async fn create_session(
        self: &Arc<Self>,
        config: SessionConfig,
        config_tool_handlers: ToolRegistry,
    ) -> Result<Arc<Session>, ClientError> {
        let connection = self.connection_handle().await?;

        let merged_defs = merge_tool_lists(&self.options.tools, &config.tools);
        let mut payload = serde_json::to_value(&config).unwrap_or_else(|_| json!({}));
        if let Value::Object(ref mut map) = payload {
            map.insert("tools".to_string(), serde_json::to_value(&merged_defs).unwrap_or_else(|_| json!([])));
        }

        let response = connection
            .send_request("session.create", Some(payload), self.options.request_timeout)
            .await?;
        let session_id = response
            .get("sessionId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClientError("session.create response missing 'sessionId'".to_string()))?
            .to_string();

        let client_tools = self.tool_registry.read().await.clone();
        let session = Session::new(session_id.clone(), connection, config, config_tool_handlers, client_tools, self.options.request_timeout);
        self.sessions.insert(session_id, session.clone());
        Ok(session)
    }

    pub async fn resume_session(
        self: &Arc<Self>,
        session_id: impl Into<String>,
        config: SessionConfig,
        config_tool_handlers: ToolRegistry,
    ) -> Result<Arc<Session>, ClientError> {
        let session_id = session_id.into();
        let connection = self.connection_handle().await?;

        let merged_defs = merge_tool_lists(&self.options.tools, &config.tools);
        let mut payload = serde_json::to_value(&config).unwrap_or_else(|_| json!({}));
        if let Value::Object(ref mut map) = payload {
            map.insert("sessionId".to_string(), json!(session_id));
            map.insert("tools".to_string(), serde_json::to_value(&merged_defs).unwrap_or_else(|_| json!([])));
        }

        connection
            .send_request("session.resume", Some(payload), self.options.request_timeout)
            .await?;

        let client_tools = self.tool_registry.read().await.clone();
        let session = Session::new(session_id.clone(), connection, config, config_tool_handlers, client_tools, self.options.request_timeout);
        self.sessions.insert(session_id, session.clone());
        Ok(session)
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    // -- metadata single-flight cache --

    /// `models.list` and similarly cheap, rarely-changing metadata calls are
    /// single-flighted: concurrent callers share one in-flight request rather
    /// than issuing it once each.
    pub async fn list_models(self: &Arc<Self>, force_refresh: bool) -> Result<Value, ClientError> {
        self.cached_metadata_request("models.list", force_refresh).await
    }

    async fn cached_metadata_request(self: &Arc<Self>, method: &str, force_refresh: bool) -> Result<Value, ClientError> {
        let fut = {
            let mut cache = self.metadata_cache.lock().await;
            if force_refresh {
                cache.remove(method);
            }
            if let Some(existing) = cache.get(method) {
                Shared::clone(existing)
            } else {
                let client = Arc::clone(self);
                let method_owned = method.to_string();
                let shared: CachedMetadata = async move {
                    let connection = client.connection_handle().await.map_err(|e| e.0)?;
                    connection
                        .send_request(&method_owned, None, client.options.request_timeout)
                        .await
                        .map_err(|e| e.to_string())
                }
                .boxed()
                .shared();
                cache.insert(method.to_string(), shared.clone());
                shared
            }
        };
        let result = fut.await.map_err(ClientError);
        // a failed fetch shouldn't poison the cache for the next caller.
        if result.is_err() {
            self.metadata_cache.lock().await.remove(method);
        }
        result
    }

    // -- stop --

    /// Graceful stop: attempts to destroy every live session, retrying each
    /// up to 3 times with exponential backoff, collects any errors, then
    /// closes the transport and clears the metadata cache regardless of
    /// whether every session tore down cleanly.
    pub async fn stop(self: &Arc<Self>) -> Result<(), ClientError> {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(100));
        let mut errors = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            if let Err(e) = session.destroy_with_retry(&policy).await {
                errors.push(format!("{}: {e}", session.session_id()));
            }
        }
        self.sessions.clear();
        self.metadata_cache.lock().await.clear();

        if let Some(connection) = self.connection.write().await.take() {
            let _ = connection.close().await;
        }
        self.set_state(ClientState::Disconnected).await;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ClientError(format!("stop: session teardown errors: {}", errors.join("; "))))
        }
    }

    /// Immediate stop: skips graceful per-session destruction and suppresses
    /// the auto-restart that would otherwise fire from the resulting close
    /// callback.
    pub async fn force_stop(self: &Arc<Self>) -> Result<(), ClientError> {
        self.force_stopping.store(true, Ordering::SeqCst);
        for entry in self.sessions.iter() {
            entry.value().handle_connection_close();
        }
        self.sessions.clear();
        self.metadata_cache.lock().await.clear();
        if let Some(connection) = self.connection.write().await.take() {
            let _ = connection.close().await;
        }
        self.set_state(ClientState::Disconnected).await;
        Ok(())
    }
}

/// Shared bound for the three request-delegate traits so
/// `handle_delegated_request` can be generic over which slot it reads.
#[async_trait]
trait DelegatedHandler: Send + Sync {
    async fn handle(&self, params: Value) -> anyhow::Result<Value>;
}

#[async_trait]
impl DelegatedHandler for dyn PermissionHandler {
    async fn handle(&self, params: Value) -> anyhow::Result<Value> {
        PermissionHandler::handle(self, params).await
    }
}

#[async_trait]
impl DelegatedHandler for dyn UserInputHandler {
    async fn handle(&self, params: Value) -> anyhow::Result<Value> {
        UserInputHandler::handle(self, params).await
    }
}
