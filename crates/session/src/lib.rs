#![forbid(unsafe_code)]

//! `mcp-session` is a client-side runtime for the Model Context Protocol.
//!
//! It drives the `initialize` handshake over any [`mcp_link::Transport`],
//! multiplexes concurrent requests over the single connection, dispatches
//! server-initiated requests (`ping`, `roots/list`, `sampling/createMessage`)
//! and notifications to built-in and user-registered handlers, and exposes
//! typed operations for tools, resources, prompts, and logging.
//!
//! ```no_run
//! use mcp_session::{ClientBuilder, Root};
//! use mcp_link::StdioTransport;
//!
//! # async fn run() -> mcp_session::Result<()> {
//! let client = ClientBuilder::new()
//!     .root(Root { uri: "file:///workspace".into(), name: Some("workspace".into()) })
//!     .tools_change_consumer(|tools| async move {
//!         println!("tools updated: {}", tools.len());
//!         Ok(())
//!     })
//!     .connect(StdioTransport::new("my-mcp-server", [])).await?;
//!
//! let tools = client.list_all_tools().await?;
//! # let _ = tools;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod handlers;
pub mod protocol;
mod sync;
pub mod types;

pub use client::{Client, ClientBuilder, SessionState};
pub use error::{Error, Result};
pub use handlers::{
    LoggingConsumer, ProgressConsumer, PromptsChangeConsumer, ResourceUpdatedConsumer,
    ResourcesChangeConsumer, SamplingHandler, ToolsChangeConsumer,
};
pub use protocol::{
    McpNotification, McpRequest, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
pub use sync::SyncClient;
pub use types::{
    ClientCapabilities, Implementation, LoggingLevel, Prompt, Resource, ResourceTemplate, Root,
    ServerCapabilities, Tool,
};
