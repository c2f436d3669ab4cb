//! Error taxonomy shared by the registry, the worker and the call proxy.

use std::time::Duration;

use crate::bridge::codec::CodecError;
use crate::bridge::protocol::MessageId;

/// Every failure a caller of this crate can observe.
///
/// Cloneable so a single failure can be handed to a pending waiter and
/// logged at the same time; I/O and JSON errors are captured as text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// Bad length prefix or truncated frame. Fatal to the connection.
    #[error("framing error: {0}")]
    Framing(String),

    /// Peer broke the protocol (e.g. first frame was not RegisterWorker).
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no workers connected to handle the request")]
    NoWorkersConnected,

    #[error("worker {0} is not registered")]
    WorkerNotRegistered(String),

    /// The connection carrying a call went away before it was answered.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The remote handler failed; carries its message.
    #[error("{0}")]
    Remote(String),

    #[error("parameter count mismatch: expected {expected}, got {actual}")]
    ParameterCountMismatch { expected: usize, actual: usize },

    #[error("method {0} not found")]
    MethodNotFound(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// A call with this message id is already awaiting a response.
    #[error("request already pending: message {0}")]
    DuplicatePending(MessageId),

    #[error("invalid payload: {0}")]
    Payload(String),

    #[error("not connected to the registry")]
    NotConnected,

    #[error("server is shutting down")]
    Shutdown,

    #[error("i/o error: {0}")]
    Io(String),
}

impl RpcError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost(message.into())
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote(message.into())
    }

    /// True for failures that mean the underlying channel is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Framing(_) | Self::ConnectionLost(_) | Self::Io(_) | Self::NotConnected
        )
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::Payload(e.to_string())
    }
}

impl From<CodecError> for RpcError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => Self::Io(e.to_string()),
            other => Self::Framing(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
