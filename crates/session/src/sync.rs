//! Blocking façade over the async client.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;

use mcp_link::Transport;

use crate::client::{Client, ClientBuilder, SessionState};
use crate::error::Result;
use crate::types::{
    CallToolResult, GetPromptResult, Implementation, ListPromptsResult, ListResourcesResult,
    ListToolsResult, LoggingLevel, Prompt, ReadResourceResult, Resource, Root, ServerCapabilities,
    Tool,
};

/// Blocking wrapper over [`Client`].
///
/// Owns a private runtime; every call blocks until the underlying async
/// operation resolves, which is bounded by the session's `request_timeout`
/// (expiry yields the same timeout error as the async API and cancels the
/// in-flight request). Must not be used from inside an async context.
pub struct SyncClient {
    client: Client,
    runtime: tokio::runtime::Runtime,
}

impl SyncClient {
    pub(crate) fn connect<T: Transport>(builder: ClientBuilder, transport: T) -> Result<SyncClient> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(mcp_link::Error::from)?;
        let client = runtime.block_on(builder.connect(transport))?;
        Ok(Self { client, runtime })
    }

    fn wait<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// The wrapped async client, for callers that need both surfaces.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn state(&self) -> SessionState {
        self.client.state()
    }

    pub fn server_capabilities(&self) -> Option<&ServerCapabilities> {
        self.client.server_capabilities()
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.client.server_info()
    }

    pub fn request_timeout(&self) -> Duration {
        self.client.request_timeout()
    }

    pub fn ping(&self) -> Result<Value> {
        self.wait(self.client.ping())
    }

    pub fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult> {
        self.wait(self.client.list_tools(cursor))
    }

    pub fn list_all_tools(&self) -> Result<Vec<Tool>> {
        self.wait(self.client.list_all_tools())
    }

    pub fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        self.wait(self.client.call_tool(name, arguments))
    }

    pub fn list_resources(&self, cursor: Option<String>) -> Result<ListResourcesResult> {
        self.wait(self.client.list_resources(cursor))
    }

    pub fn list_all_resources(&self) -> Result<Vec<Resource>> {
        self.wait(self.client.list_all_resources())
    }

    pub fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        self.wait(self.client.read_resource(uri))
    }

    pub fn subscribe_resource<F, Fut>(&self, uri: impl Into<String>, consumer: F) -> Result<()>
    where
        F: Fn(crate::types::ResourceUpdatedParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.wait(self.client.subscribe_resource(uri, consumer))
    }

    pub fn unsubscribe_resource(&self, uri: &str) -> Result<()> {
        self.wait(self.client.unsubscribe_resource(uri))
    }

    pub fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResult> {
        self.wait(self.client.list_prompts(cursor))
    }

    pub fn list_all_prompts(&self) -> Result<Vec<Prompt>> {
        self.wait(self.client.list_all_prompts())
    }

    pub fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<GetPromptResult> {
        self.wait(self.client.get_prompt(name, arguments))
    }

    pub fn set_logging_level(&self, level: LoggingLevel) -> Result<()> {
        self.wait(self.client.set_logging_level(level))
    }

    pub fn complete(&self, params: Value) -> Result<Value> {
        self.wait(self.client.complete(params))
    }

    pub fn roots(&self) -> Vec<Root> {
        self.client.roots()
    }

    pub fn add_root(&self, root: Root) -> Result<()> {
        self.wait(self.client.add_root(root))
    }

    pub fn remove_root(&self, uri: &str) -> Result<bool> {
        self.wait(self.client.remove_root(uri))
    }

    /// Closes the session. Also invoked on drop, best effort.
    pub fn close(&self) -> Result<()> {
        self.wait(self.client.close())
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if matches!(self.state(), SessionState::Closing | SessionState::Closed) {
            return;
        }
        let close = self.client.close();
        let _ = self
            .runtime
            .block_on(async { tokio::time::timeout(Duration::from_secs(2), close).await });
    }
}
