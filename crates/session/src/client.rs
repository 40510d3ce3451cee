//! The session engine: builder, initialize handshake, typed operations.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::Value;

use mcp_link::{Endpoint, EndpointHandle, EndpointOptions, Id, Transport};

use crate::error::{Error, Result};
use crate::handlers::{
    self, BoxFuture, HandlerConfig, LoggingConsumer, ProgressConsumer, PromptsChangeConsumer,
    ResourceUpdatedConsumer, ResourcesChangeConsumer, SamplingHandler, ToolsChangeConsumer,
};
use crate::protocol::{
    McpNotification, McpRequest, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::sync::SyncClient;
use crate::types::{
    CallToolRequest, CallToolRequestParams, CallToolResult, ClientCapabilities, CompleteRequest,
    CreateMessageRequestParams, CreateMessageResult, GetPromptRequest, GetPromptRequestParams,
    GetPromptResult, Implementation, InitializeRequest, InitializeRequestParams,
    InitializedNotification, ListPromptsRequest, ListPromptsResult, ListResourceTemplatesRequest,
    ListResourceTemplatesResult, ListResourcesRequest, ListResourcesResult, ListToolsRequest,
    ListToolsResult, LoggingLevel, LoggingMessageParams, PaginatedRequestParams, PingRequest,
    Prompt, ReadResourceRequest, ReadResourceRequestParams, ReadResourceResult, Resource,
    ResourceUpdatedParams, ResourcesCapability, Root, RootsCapability, RootsListChangedNotification,
    SamplingCapability, ServerCapabilities, SetLevelRequest, SetLevelRequestParams,
    SubscribeRequest, SubscribeRequestParams, Tool, UnsubscribeRequest,
};

/// Session lifecycle. Only `Initialized` permits user-facing operations;
/// `ping` is additionally allowed while `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Initialized = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> SessionState {
        match value {
            1 => SessionState::Connecting,
            2 => SessionState::Initialized,
            3 => SessionState::Closing,
            4 => SessionState::Closed,
            _ => SessionState::Disconnected,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Initialized => "initialized",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        name.fmt(f)
    }
}

/// Configures and connects an MCP client session.
///
/// The `roots` capability is advertised iff any root is registered; the
/// `sampling` capability iff a sampling handler is registered. An explicit
/// [`ClientBuilder::capabilities`] override is taken as-is, with those two
/// entries re-ensured when the corresponding feature is configured.
pub struct ClientBuilder {
    request_timeout: Duration,
    client_info: Implementation,
    capabilities: Option<ClientCapabilities>,
    roots: Vec<Root>,
    sampling_handler: Option<SamplingHandler>,
    tools_consumers: Vec<ToolsChangeConsumer>,
    resources_consumers: Vec<ResourcesChangeConsumer>,
    prompts_consumers: Vec<PromptsChangeConsumer>,
    logging_consumer: Option<LoggingConsumer>,
    endpoint_options: EndpointOptions,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            request_timeout: Duration::from_secs(20),
            client_info: Implementation::new("mcp-session", env!("CARGO_PKG_VERSION")),
            capabilities: None,
            roots: Vec::new(),
            sampling_handler: None,
            tools_consumers: Vec::new(),
            resources_consumers: Vec::new(),
            prompts_consumers: Vec::new(),
            logging_consumer: None,
            endpoint_options: EndpointOptions::default(),
        }
    }

    /// Deadline applied to every request issued by this session.
    /// Default: 20 seconds.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_info = Implementation::new(name, version);
        self
    }

    /// Explicit capability override. Without it, capabilities are derived from
    /// the registered roots and sampling handler.
    pub fn capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Registers a root. Duplicate uris replace the earlier entry.
    pub fn root(mut self, root: Root) -> Self {
        upsert_root(&mut self.roots, root);
        self
    }

    pub fn roots(mut self, roots: impl IntoIterator<Item = Root>) -> Self {
        for root in roots {
            upsert_root(&mut self.roots, root);
        }
        self
    }

    /// Handler for server-initiated `sampling/createMessage` requests.
    /// Registering one enables the `sampling` capability.
    pub fn sampling_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(CreateMessageRequestParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<CreateMessageResult>> + Send + 'static,
    {
        self.sampling_handler = Some(Arc::new(move |request| -> BoxFuture<
            anyhow::Result<CreateMessageResult>,
        > {
            Box::pin(handler(request))
        }));
        self
    }

    /// Called with the full refreshed tool list after every
    /// `notifications/tools/list_changed`. May be registered multiple times.
    pub fn tools_change_consumer<F, Fut>(mut self, consumer: F) -> Self
    where
        F: Fn(Vec<Tool>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tools_consumers
            .push(Arc::new(move |tools| -> BoxFuture<anyhow::Result<()>> {
                Box::pin(consumer(tools))
            }));
        self
    }

    pub fn resources_change_consumer<F, Fut>(mut self, consumer: F) -> Self
    where
        F: Fn(Vec<Resource>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.resources_consumers
            .push(Arc::new(move |resources| -> BoxFuture<anyhow::Result<()>> {
                Box::pin(consumer(resources))
            }));
        self
    }

    pub fn prompts_change_consumer<F, Fut>(mut self, consumer: F) -> Self
    where
        F: Fn(Vec<Prompt>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.prompts_consumers
            .push(Arc::new(move |prompts| -> BoxFuture<anyhow::Result<()>> {
                Box::pin(consumer(prompts))
            }));
        self
    }

    /// Consumer for `notifications/message` log events.
    pub fn logging_consumer<F, Fut>(mut self, consumer: F) -> Self
    where
        F: Fn(LoggingMessageParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.logging_consumer = Some(Arc::new(
            move |message| -> BoxFuture<anyhow::Result<()>> { Box::pin(consumer(message)) },
        ));
        self
    }

    pub fn endpoint_options(mut self, options: EndpointOptions) -> Self {
        self.endpoint_options = options;
        self
    }

    fn derived_capabilities(&self) -> ClientCapabilities {
        let mut caps = self.capabilities.clone().unwrap_or_default();
        if !self.roots.is_empty() && caps.roots.is_none() {
            caps.roots = Some(RootsCapability {
                list_changed: Some(true),
            });
        }
        if self.sampling_handler.is_some() && caps.sampling.is_none() {
            caps.sampling = Some(SamplingCapability::default());
        }
        caps
    }

    /// Connects the transport, performs the initialize handshake, and returns
    /// an operational client.
    pub async fn connect<T: Transport>(self, transport: T) -> Result<Client> {
        Client::connect(self, transport).await
    }

    /// Blocking variant of [`ClientBuilder::connect`]. Must not be called
    /// from inside an async runtime.
    pub fn connect_sync<T: Transport>(self, transport: T) -> Result<SyncClient> {
        SyncClient::connect(self, transport)
    }
}

fn upsert_root(roots: &mut Vec<Root>, root: Root) {
    match roots.iter_mut().find(|existing| existing.uri == root.uri) {
        Some(existing) => *existing = root,
        None => roots.push(root),
    }
}

struct Inner {
    handle: EndpointHandle,
    state: AtomicU8,
    request_timeout: Duration,
    client_info: Implementation,
    client_capabilities: ClientCapabilities,
    server_capabilities: OnceLock<ServerCapabilities>,
    server_info: OnceLock<Implementation>,
    negotiated_version: OnceLock<String>,
    instructions: OnceLock<Option<String>>,
    roots: Mutex<Vec<Root>>,
    progress_consumers: Mutex<HashMap<Id, ProgressConsumer>>,
    updated_consumers: Mutex<HashMap<String, ResourceUpdatedConsumer>>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    endpoint: tokio::sync::Mutex<Option<Endpoint>>,
}

/// An initialized MCP client session. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("server_info", &self.inner.server_info.get())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub(crate) async fn connect<T: Transport>(
        builder: ClientBuilder,
        transport: T,
    ) -> Result<Client> {
        let client_capabilities = builder.derived_capabilities();
        let ClientBuilder {
            request_timeout,
            client_info,
            roots,
            sampling_handler,
            tools_consumers,
            resources_consumers,
            prompts_consumers,
            logging_consumer,
            endpoint_options,
            ..
        } = builder;

        let mut endpoint = Endpoint::connect(transport, endpoint_options).await?;
        let handle = endpoint.handle();
        let requests_rx = endpoint.take_requests();
        let notifications_rx = endpoint.take_notifications();

        let client = Client {
            inner: Arc::new(Inner {
                handle,
                state: AtomicU8::new(SessionState::Connecting as u8),
                request_timeout,
                client_info,
                client_capabilities,
                server_capabilities: OnceLock::new(),
                server_info: OnceLock::new(),
                negotiated_version: OnceLock::new(),
                instructions: OnceLock::new(),
                roots: Mutex::new(roots),
                progress_consumers: Mutex::new(HashMap::new()),
                updated_consumers: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                endpoint: tokio::sync::Mutex::new(Some(endpoint)),
            }),
        };

        let workers = handlers::spawn_workers(
            &client,
            requests_rx,
            notifications_rx,
            HandlerConfig {
                sampling_handler,
                tools_consumers: Arc::new(tools_consumers),
                resources_consumers: Arc::new(resources_consumers),
                prompts_consumers: Arc::new(prompts_consumers),
                logging_consumer,
            },
        );
        *lock(&client.inner.workers) = workers;

        if let Err(err) = client.initialize().await {
            client.shutdown("initialize failed").await;
            return Err(err);
        }
        Ok(client)
    }

    async fn initialize(&self) -> Result<()> {
        let params = InitializeRequestParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: self.inner.client_capabilities.clone(),
            client_info: self.inner.client_info.clone(),
        };
        let result = self.request_unchecked::<InitializeRequest>(params).await?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(Error::IncompatibleProtocolVersion {
                server: result.protocol_version,
            });
        }

        // Published exactly once, before the state flips to Initialized, and
        // read-only afterwards.
        let _ = self.inner.server_capabilities.set(result.capabilities);
        let _ = self.inner.server_info.set(result.server_info);
        let _ = self.inner.negotiated_version.set(result.protocol_version);
        let _ = self.inner.instructions.set(result.instructions);

        self.notify_typed::<InitializedNotification>(Some(serde_json::json!({})))
            .await?;
        self.inner
            .state
            .store(SessionState::Initialized as u8, Ordering::SeqCst);

        tracing::debug!(
            server = ?self.inner.server_info.get(),
            protocol_version = ?self.inner.negotiated_version.get(),
            "mcp session initialized"
        );
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Server capabilities captured during initialize; immutable for the
    /// session's lifetime.
    pub fn server_capabilities(&self) -> Option<&ServerCapabilities> {
        self.inner.server_capabilities.get()
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.inner.server_info.get()
    }

    pub fn negotiated_protocol_version(&self) -> Option<&str> {
        self.inner.negotiated_version.get().map(String::as_str)
    }

    pub fn instructions(&self) -> Option<&str> {
        self.inner
            .instructions
            .get()
            .and_then(|opt| opt.as_deref())
    }

    pub fn client_capabilities(&self) -> &ClientCapabilities {
        &self.inner.client_capabilities
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    fn ensure_initialized(&self) -> Result<()> {
        let state = self.state();
        if state == SessionState::Initialized {
            Ok(())
        } else {
            Err(Error::NotInitialized { state })
        }
    }

    fn require_capability(
        &self,
        capability: &'static str,
        check: impl FnOnce(&ServerCapabilities) -> bool,
    ) -> Result<()> {
        let caps = self
            .inner
            .server_capabilities
            .get()
            .ok_or(Error::NotInitialized {
                state: self.state(),
            })?;
        if check(caps) {
            Ok(())
        } else {
            Err(Error::CapabilityNotSupported { capability })
        }
    }

    async fn request_unchecked<R: McpRequest>(&self, params: R::Params) -> Result<R::Result> {
        let params = serde_json::to_value(params).map_err(|source| Error::SerializeParams {
            method: R::METHOD,
            source,
        })?;
        let params = (!params.is_null()).then_some(params);
        let result = self
            .inner
            .handle
            .request_with_timeout(R::METHOD, params, self.inner.request_timeout)
            .await?;
        serde_json::from_value(result).map_err(|source| Error::DeserializeResult {
            method: R::METHOD,
            source,
        })
    }

    /// Sends a typed notification to the server.
    pub async fn notify_typed<N: McpNotification>(&self, params: Option<N::Params>) -> Result<()> {
        let params = match params {
            Some(params) => {
                let value =
                    serde_json::to_value(params).map_err(|source| Error::SerializeParams {
                        method: N::METHOD,
                        source,
                    })?;
                (!value.is_null()).then_some(value)
            }
            None => None,
        };
        self.inner.handle.notify(N::METHOD, params).await?;
        Ok(())
    }

    /// `ping` is permitted while `Connecting` as well as `Initialized`.
    pub async fn ping(&self) -> Result<Value> {
        match self.state() {
            SessionState::Connecting | SessionState::Initialized => {}
            state => return Err(Error::NotInitialized { state }),
        }
        self.request_unchecked::<PingRequest>(None).await
    }

    pub async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult> {
        self.ensure_initialized()?;
        self.require_capability("tools", |caps| caps.tools.is_some())?;
        self.request_unchecked::<ListToolsRequest>(PaginatedRequestParams::cursor(cursor))
            .await
    }

    /// Chases `nextCursor` until the tool list is exhausted.
    pub async fn list_all_tools(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.list_tools(cursor).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
    }

    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        self.ensure_initialized()?;
        self.require_capability("tools", |caps| caps.tools.is_some())?;
        self.request_unchecked::<CallToolRequest>(CallToolRequestParams {
            name: name.to_string(),
            arguments,
        })
        .await
    }

    pub async fn list_resources(&self, cursor: Option<String>) -> Result<ListResourcesResult> {
        self.ensure_initialized()?;
        self.require_capability("resources", |caps| caps.resources.is_some())?;
        self.request_unchecked::<ListResourcesRequest>(PaginatedRequestParams::cursor(cursor))
            .await
    }

    pub async fn list_all_resources(&self) -> Result<Vec<Resource>> {
        let mut resources = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.list_resources(cursor).await?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(resources),
            }
        }
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        self.ensure_initialized()?;
        self.require_capability("resources", |caps| caps.resources.is_some())?;
        self.request_unchecked::<ReadResourceRequest>(ReadResourceRequestParams {
            uri: uri.to_string(),
        })
        .await
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourceTemplatesResult> {
        self.ensure_initialized()?;
        self.require_capability("resources", |caps| caps.resources.is_some())?;
        self.request_unchecked::<ListResourceTemplatesRequest>(PaginatedRequestParams::cursor(
            cursor,
        ))
        .await
    }

    /// Subscribes to change notifications for `uri` and registers the
    /// consumer that will receive `notifications/resources/updated` for it.
    pub async fn subscribe_resource<F, Fut>(&self, uri: impl Into<String>, consumer: F) -> Result<()>
    where
        F: Fn(ResourceUpdatedParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.ensure_initialized()?;
        self.require_capability("resources.subscribe", |caps| {
            caps.resources
                .as_ref()
                .is_some_and(ResourcesCapability::supports_subscribe)
        })?;
        let uri = uri.into();
        lock(&self.inner.updated_consumers).insert(
            uri.clone(),
            Arc::new(move |update| -> BoxFuture<anyhow::Result<()>> {
                Box::pin(consumer(update))
            }),
        );

        let outcome = self
            .request_unchecked::<SubscribeRequest>(SubscribeRequestParams { uri: uri.clone() })
            .await;
        if outcome.is_err() {
            lock(&self.inner.updated_consumers).remove(&uri);
        }
        outcome.map(|_| ())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<()> {
        self.ensure_initialized()?;
        self.require_capability("resources.subscribe", |caps| {
            caps.resources
                .as_ref()
                .is_some_and(ResourcesCapability::supports_subscribe)
        })?;
        self.request_unchecked::<UnsubscribeRequest>(SubscribeRequestParams {
            uri: uri.to_string(),
        })
        .await?;
        lock(&self.inner.updated_consumers).remove(uri);
        Ok(())
    }

    pub async fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResult> {
        self.ensure_initialized()?;
        self.require_capability("prompts", |caps| caps.prompts.is_some())?;
        self.request_unchecked::<ListPromptsRequest>(PaginatedRequestParams::cursor(cursor))
            .await
    }

    pub async fn list_all_prompts(&self) -> Result<Vec<Prompt>> {
        let mut prompts = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.list_prompts(cursor).await?;
            prompts.extend(page.prompts);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(prompts),
            }
        }
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<GetPromptResult> {
        self.ensure_initialized()?;
        self.require_capability("prompts", |caps| caps.prompts.is_some())?;
        self.request_unchecked::<GetPromptRequest>(GetPromptRequestParams {
            name: name.to_string(),
            arguments,
        })
        .await
    }

    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<()> {
        self.ensure_initialized()?;
        self.require_capability("logging", |caps| caps.logging.is_some())?;
        self.request_unchecked::<SetLevelRequest>(SetLevelRequestParams { level })
            .await?;
        Ok(())
    }

    pub async fn complete(&self, params: Value) -> Result<Value> {
        self.ensure_initialized()?;
        self.request_unchecked::<CompleteRequest>(params).await
    }

    /// Snapshot of the current roots, in insertion order.
    pub fn roots(&self) -> Vec<Root> {
        lock(&self.inner.roots).clone()
    }

    /// Adds (or replaces, keyed by uri) a root and announces the change.
    pub async fn add_root(&self, root: Root) -> Result<()> {
        self.ensure_initialized()?;
        upsert_root(&mut lock(&self.inner.roots), root);
        self.notify_typed::<RootsListChangedNotification>(None).await
    }

    /// Removes a root by uri; announces the change when something was removed.
    pub async fn remove_root(&self, uri: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let removed = {
            let mut roots = lock(&self.inner.roots);
            let before = roots.len();
            roots.retain(|root| root.uri != uri);
            roots.len() != before
        };
        if removed {
            self.notify_typed::<RootsListChangedNotification>(None)
                .await?;
        }
        Ok(removed)
    }

    /// Registers a consumer for `notifications/progress` events carrying
    /// `token`.
    pub fn on_progress<F, Fut>(&self, token: Id, consumer: F)
    where
        F: Fn(crate::types::ProgressParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        lock(&self.inner.progress_consumers).insert(
            token,
            Arc::new(move |progress| -> BoxFuture<anyhow::Result<()>> {
                Box::pin(consumer(progress))
            }),
        );
    }

    pub fn clear_progress(&self, token: &Id) {
        lock(&self.inner.progress_consumers).remove(token);
    }

    /// Closes the session: outstanding requests fail with "session closed",
    /// the transport is shut down, and handler workers stop. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.shutdown("session closed").await;
        Ok(())
    }

    pub(crate) async fn shutdown(&self, reason: &str) {
        loop {
            let current = self.inner.state.load(Ordering::SeqCst);
            let state = SessionState::from_u8(current);
            if matches!(state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            if self
                .inner
                .state
                .compare_exchange(
                    current,
                    SessionState::Closing as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                break;
            }
        }

        let endpoint = self.inner.endpoint.lock().await.take();
        match endpoint {
            Some(mut endpoint) => endpoint.close(reason).await,
            None => self.inner.handle.close(reason).await,
        }

        let workers = std::mem::take(&mut *lock(&self.inner.workers));
        for task in workers {
            task.abort();
        }

        self.inner
            .state
            .store(SessionState::Closed as u8, Ordering::SeqCst);
        tracing::debug!(%reason, "mcp session closed");
    }

    pub(crate) fn link_handle(&self) -> &EndpointHandle {
        &self.inner.handle
    }

    pub(crate) fn progress_consumer(&self, token: &Id) -> Option<ProgressConsumer> {
        lock(&self.inner.progress_consumers).get(token).cloned()
    }

    pub(crate) fn updated_consumer(&self, uri: &str) -> Option<ResourceUpdatedConsumer> {
        lock(&self.inner.updated_consumers).get(uri).cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_derive_from_roots_and_sampling() {
        let builder = ClientBuilder::new();
        assert_eq!(builder.derived_capabilities(), ClientCapabilities::default());

        let builder = ClientBuilder::new().root(Root {
            uri: "file:///a".to_string(),
            name: None,
        });
        let caps = builder.derived_capabilities();
        assert_eq!(
            caps.roots,
            Some(RootsCapability {
                list_changed: Some(true)
            })
        );
        assert!(caps.sampling.is_none());

        let builder = ClientBuilder::new().sampling_handler(|_request| async {
            anyhow::bail!("unused")
        });
        let caps = builder.derived_capabilities();
        assert!(caps.roots.is_none());
        assert!(caps.sampling.is_some());
    }

    #[test]
    fn explicit_capabilities_override_keeps_configured_features() {
        let mut experimental = serde_json::Map::new();
        experimental.insert("x".to_string(), serde_json::json!(true));
        let builder = ClientBuilder::new()
            .capabilities(ClientCapabilities {
                experimental: Some(experimental.clone()),
                ..Default::default()
            })
            .root(Root {
                uri: "file:///a".to_string(),
                name: None,
            });

        let caps = builder.derived_capabilities();
        assert_eq!(caps.experimental, Some(experimental));
        assert!(caps.roots.is_some());
    }

    #[test]
    fn duplicate_root_uri_replaces_earlier_entry() {
        let builder = ClientBuilder::new()
            .root(Root {
                uri: "file:///a".to_string(),
                name: Some("first".to_string()),
            })
            .root(Root {
                uri: "file:///b".to_string(),
                name: None,
            })
            .root(Root {
                uri: "file:///a".to_string(),
                name: Some("second".to_string()),
            });

        assert_eq!(builder.roots.len(), 2);
        assert_eq!(builder.roots[0].uri, "file:///a");
        assert_eq!(builder.roots[0].name.as_deref(), Some("second"));
        assert_eq!(builder.roots[1].uri, "file:///b");
    }

    #[test]
    fn session_state_displays_lowercase() {
        assert_eq!(SessionState::Initialized.to_string(), "initialized");
        assert_eq!(SessionState::Closing.to_string(), "closing");
    }
}
