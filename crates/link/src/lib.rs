#![forbid(unsafe_code)]

//! `mcp-link` is the JSON-RPC 2.0 link layer used by MCP clients.
//!
//! It provides:
//! - the wire schema: typed envelopes (request / response / error / notification)
//!   classified from raw JSON ([`Message`])
//! - a transport contract ([`Transport`]) plus reference bindings:
//!   - newline-delimited JSON over any `AsyncRead`/`AsyncWrite` pair
//!   - stdio (spawned child process)
//!   - "streamable http" (HTTP SSE + POST), commonly used by remote MCP servers
//!     - Redirects are disabled by default (opt in via `StreamableHttpOptions::follow_redirects`).
//! - the bidirectional [`Endpoint`]: request-id minting, parked awaiters,
//!   response correlation, per-request deadlines, and routing of
//!   server-initiated requests and notifications
//!
//! Design goals:
//! - Minimal ceremony (`serde_json::Value` payloads; typed schemas live upstream)
//! - Support both notifications and server->client requests
//! - Bounded queues + per-message size limits to reduce DoS risk
//!
//! Non-goals:
//! - Implementing a JSON-RPC server
//! - Automatic reconnect

use std::time::Duration;

use serde_json::Value;

pub mod endpoint;
pub mod message;
mod streamable_http;
pub mod transport;

pub use endpoint::{
    Endpoint, EndpointHandle, EndpointOptions, EndpointStats, IncomingRequest, Notification,
    CANCELLED_NOTIFICATION_METHOD,
};
pub use message::{
    Id, Malformed, Message, RpcError, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    JSONRPC_VERSION, METHOD_NOT_FOUND, PARSE_ERROR, SERVER_OVERLOADED,
};
pub use streamable_http::{StreamableHttpOptions, StreamableHttpTransport};
pub use transport::{IoTransport, Limits, MessageSink, StdioOptions, StdioTransport, Transport};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// The peer answered one of our requests with a JSON-RPC error response.
    #[error("json-rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("request timed out after {timeout:?}: {method}")]
    Timeout { method: String, timeout: Duration },
    #[error("request cancelled: {reason}")]
    Cancelled { reason: String },
    #[error("endpoint closed: {reason}")]
    Closed { reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed { .. })
    }

    /// Returns `(code, message)` when this is a JSON-RPC error response.
    pub fn rpc_error(&self) -> Option<(i64, &str)> {
        match self {
            Error::Rpc { code, message, .. } => Some((*code, message.as_str())),
            _ => None,
        }
    }

    // `oneshot` awaiters each need an owned error; io errors are not `Clone`,
    // so drain paths rebuild an equivalent value.
    pub(crate) fn clone_for_drain(&self) -> Error {
        match self {
            Error::Io(err) => Error::Io(std::io::Error::new(err.kind(), err.to_string())),
            Error::Json(err) => Error::InvalidMessage(format!("json error: {err}")),
            Error::Rpc {
                code,
                message,
                data,
            } => Error::Rpc {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            Error::Timeout { method, timeout } => Error::Timeout {
                method: method.clone(),
                timeout: *timeout,
            },
            Error::Cancelled { reason } => Error::Cancelled {
                reason: reason.clone(),
            },
            Error::Closed { reason } => Error::Closed {
                reason: reason.clone(),
            },
            Error::Transport(reason) => Error::Transport(reason.clone()),
            Error::InvalidMessage(reason) => Error::InvalidMessage(reason.clone()),
            Error::InvalidInput(reason) => Error::InvalidInput(reason.clone()),
        }
    }
}
