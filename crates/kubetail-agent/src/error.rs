//! Error types for agent connections.

use thiserror::Error;

use crate::protocol::RemoteError;

/// Errors seen by agent clients.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent answered the request with an error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The connection to the agent ended before the request finished.
    #[error("connection to agent closed")]
    ConnectionClosed,

    /// The connection manager has been shut down.
    #[error("connection manager closed")]
    ManagerClosed,

    /// No agent is known for the node.
    #[error("no agent found for node `{0}`")]
    UnknownNode(String),

    /// Agent endpoints could not be resolved.
    #[error("failed to resolve agents: {0}")]
    Resolve(String),

    /// The agent sent a frame that does not fit the request.
    #[error("unexpected response from agent: {0}")]
    UnexpectedResponse(&'static str),

    /// A frame could not be encoded or decoded.
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),

    /// Kubernetes API error while resolving or port-forwarding.
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
