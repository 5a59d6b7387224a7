#![warn(missing_docs, missing_debug_implementations)]

//! AMQP 1.0 connection, session and link state machines for hub device clients
//!
//! This crate drives the lifecycle of a single AMQP connection: opening the connection
//! and its session, authenticating with claims-based security (CBS), attaching sender
//! and receiver links per endpoint, and tearing everything down in order, with a
//! watchdog that forces the teardown when the peer stops answering.
//!
//! Frames and sockets are not handled here. The wire engine is consumed through the
//! traits in [`transport`], which expose connection, session and link objects and report
//! their lifecycle through tagged [`EventSink`](transport::EventSink)s.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use iothub_amqp::{ConnectionConfig, ConnectionManager, LinkOptions};
//!
//! let manager = ConnectionManager::new(transport);
//! manager.connect(ConnectionConfig::from_url("amqps://myhub.example.net")?).await?;
//! manager.put_token("myhub.example.net/devices/d1", sas_token).await?;
//!
//! let receiver = manager
//!     .attach_receiver_link("/devices/d1/messages/devicebound", LinkOptions::default())
//!     .await?;
//! let mut messages = receiver.subscribe().await?;
//! while let Some(message) = messages.recv().await {
//!     let message = message?;
//!     receiver.complete(&message).await?;
//! }
//! ```

pub mod cbs;
pub mod config;
pub mod constants;
pub mod error;
pub mod link;
pub mod results;
pub mod transport;

mod connection;
mod util;

pub use cbs::{CbsConfig, CbsState};
pub use config::{ConnectionConfig, SaslMechanism};
pub use connection::{ConnectionManager, ConnectionState, DisconnectHandler, LinkErrorHandler};
pub use error::{Error, Result};
pub use link::{LinkOptions, LinkState, LockToken, MessageStream, ReceivedMessage, Receiver, Sender};
pub use util::Completion;
