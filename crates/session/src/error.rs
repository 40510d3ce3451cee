use crate::client::SessionState;
use crate::protocol::SUPPORTED_PROTOCOL_VERSIONS;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport, correlation, timeout, cancellation, or peer-reported errors
    /// from the link layer.
    #[error(transparent)]
    Link(#[from] mcp_link::Error),
    /// An operation other than `initialize`/`ping` was invoked outside the
    /// `Initialized` state. Raised synchronously; nothing is written to the
    /// wire.
    #[error("session is {state}; operation requires an initialized session")]
    NotInitialized { state: SessionState },
    /// The server did not advertise the capability this operation needs.
    /// Raised synchronously; nothing is written to the wire.
    #[error("server does not support {capability}")]
    CapabilityNotSupported { capability: &'static str },
    #[error(
        "incompatible protocol version from server: {server:?} (supported: {:?})",
        SUPPORTED_PROTOCOL_VERSIONS
    )]
    IncompatibleProtocolVersion { server: String },
    #[error("serialize {method} params: {source}")]
    SerializeParams {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("deserialize {method} result: {source}")]
    DeserializeResult {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Link(err) if err.is_timeout())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Link(err) if err.is_closed())
    }

    /// Returns `(code, message)` when the server answered with a JSON-RPC
    /// error response.
    pub fn rpc_error(&self) -> Option<(i64, &str)> {
        match self {
            Error::Link(err) => err.rpc_error(),
            _ => None,
        }
    }
}
