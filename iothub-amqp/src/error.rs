//! Error taxonomy shared by the connection, link and CBS state machines

use fe2o3_amqp_types::definitions::{self, AmqpError, ErrorCondition, LinkError};
use tokio::sync::{mpsc, oneshot};

/// Errors surfaced through completions and notification handlers
///
/// The type is `Clone` because a single teardown error is fanned out to every
/// pending operation it resolves.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The operation requires a connected state
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// An argument was rejected before any state machine input was issued
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A disposition was attempted on an unknown or already settled delivery
    #[error("Lock lost: {0}")]
    LockLost(String),

    /// The CBS node answered a put-token request with a non-success status
    #[error("Unauthorized (status code {status_code:?}): {description:?}")]
    Unauthorized {
        /// Status code found in the response, if any
        status_code: Option<i64>,
        /// Status description found in the response, if any
        description: Option<String>,
    },

    /// The operation did not complete within its window
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The link was detached before the operation could complete
    #[error("Link detached")]
    LinkDetached,

    /// A detach was requested while an attach was still in progress
    #[error("Unexpected detach while attaching")]
    UnexpectedDetach,

    /// The remote peer rejected a delivery
    #[error("Message rejected {:?}", .0)]
    Rejected(Option<definitions::Error>),

    /// The remote peer released a delivery
    #[error("Message released")]
    Released,

    /// Uncategorized error from the underlying connection, session or link
    #[error("AMQP error {:?}, {:?}", .0.condition, .0.description)]
    Amqp(definitions::Error),

    /// The engine event loop has stopped
    #[error("Engine stopped")]
    EngineStopped,
}

impl Error {
    /// Creates an [`Error::Amqp`] with an [`AmqpError`] condition
    pub fn amqp_error(
        condition: impl Into<AmqpError>,
        description: impl Into<Option<String>>,
    ) -> Self {
        Self::Amqp(definitions::Error::new(
            ErrorCondition::AmqpError(condition.into()),
            description,
            None,
        ))
    }

    /// Creates an [`Error::Amqp`] with a [`LinkError`] condition
    pub fn link_error(
        condition: impl Into<LinkError>,
        description: impl Into<Option<String>>,
    ) -> Self {
        Self::Amqp(definitions::Error::new(
            ErrorCondition::LinkError(condition.into()),
            description,
            None,
        ))
    }

    pub(crate) fn not_connected(what: impl std::fmt::Display) -> Self {
        Self::NotConnected(format!("{} requires an open connection", what))
    }

    pub(crate) fn lock_lost() -> Self {
        Self::LockLost(String::from(
            "the delivery is unknown or the link is no longer attached",
        ))
    }
}

impl From<definitions::Error> for Error {
    fn from(err: definitions::Error) -> Self {
        Self::Amqp(err)
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
