//! Errors of the registration state machine

use tokio::sync::{mpsc, oneshot};

use crate::transport::{RegistrationResult, ResponseInfo};

/// Error returned by [`PollingTransport`](crate::transport::PollingTransport) implementations
pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced through registration, cancel and disconnect completions
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A registration was requested while another one is still in flight
    #[error("Invalid operation: another operation is in progress")]
    OperationInProgress,

    /// The registration was cancelled, explicitly or by a disconnect
    #[error("Operation cancelled")]
    OperationCancelled,

    /// The service did not answer within the operation timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The service reported the registration as failed
    #[error("Device registration failed")]
    DeviceRegistrationFailed {
        /// The result reported by the service
        result: Box<RegistrationResult>,
        /// The response that carried it
        response: ResponseInfo,
    },

    /// The service answered with a status this client does not understand
    #[error("Unexpected registration status {status:?}")]
    Syntax {
        /// The offending status
        status: String,
        /// The result reported by the service
        result: Box<RegistrationResult>,
        /// The response that carried it
        response: ResponseInfo,
    },

    /// A registration result could not be decoded
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The transport failed
    #[error("Transport error: {0}")]
    Transport(#[source] TransportError),

    /// The state machine has stopped
    #[error("Engine stopped")]
    EngineStopped,
}

impl Error {
    /// Wraps any error raised by a transport
    pub fn transport(error: impl Into<TransportError>) -> Self {
        Self::Transport(error.into())
    }
}

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::EngineStopped
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(_: oneshot::error::RecvError) -> Self {
        Self::EngineStopped
    }
}

/// A specialized `Result` type for this crate
pub type Result<T> = std::result::Result<T, Error>;
