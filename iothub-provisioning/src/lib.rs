#![warn(missing_docs, missing_debug_implementations)]

//! Register/poll state machine for device provisioning
//!
//! A device registers with the provisioning service by sending a registration request and
//! then polling the operation the service created until the device is assigned to a hub.
//! [`PollingStateMachine`] drives that exchange over any [`PollingTransport`], with a
//! watchdog on every request, cancellation, and at most one registration in flight.

pub mod config;
pub mod error;
pub mod transport;

mod polling;
mod util;

pub use config::PollingConfig;
pub use error::{Error, Result};
pub use polling::{PollingState, PollingStateMachine, Registration};
pub use transport::{
    PollingTransport, RegistrationRequest, RegistrationResult, RegistrationState, ResponseInfo,
    TransportReply,
};
