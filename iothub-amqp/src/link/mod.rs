//! Sender and receiver link endpoints
//!
//! An endpoint owns at most one underlying link at a time and re-creates it under a fresh
//! name on every attach. The connection engine owns the endpoints; the [`Sender`] and
//! [`Receiver`] handles only carry the endpoint address, so they never keep a detached
//! endpoint alive.

mod handle;
mod options;
pub(crate) mod receiver;
pub(crate) mod sender;
mod state;

pub use handle::{MessageStream, Receiver, Sender};
pub use options::LinkOptions;
pub use receiver::{LockToken, ReceivedMessage};
pub use state::LinkState;

pub(crate) use options::Role;
pub(crate) use state::LinkContext;
