//! Contracts consumed from the underlying AMQP 1.0 engine
//!
//! The state machines in this crate never touch frames or sockets. They drive an engine
//! through the traits below and react to the lifecycle events the engine emits through
//! an [`EventSink`].
//!
//! Every object is handed its sink in the same call that creates it, so no event the
//! object produces can be observed before the state machine is ready to handle it.

use fe2o3_amqp_types::{
    definitions,
    messaging::{Body, Message},
    primitives::Value,
};
use tokio::sync::mpsc;

use crate::{config::TransportParameters, error::Result, link::LinkOptions, Error};

/// The AMQP message type carried by links
pub type AmqpMessage = Message<Body<Value>>;

/// Delivery identifier assigned by a sender link
pub type DeliveryId = u32;

pub(crate) type EventTx<E> = mpsc::UnboundedSender<(String, E)>;
pub(crate) type EventRx<E> = mpsc::UnboundedReceiver<(String, E)>;

/// Sink through which an engine object reports its lifecycle events
///
/// Each sink is tagged with the name of the object it was created for. Events carrying a
/// tag that no longer matches the current object are discarded by the state machine.
#[derive(Debug)]
pub struct EventSink<E> {
    tag: String,
    tx: EventTx<E>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            tag: self.tag.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<E> EventSink<E> {
    pub(crate) fn new(tag: impl Into<String>, tx: EventTx<E>) -> Self {
        Self {
            tag: tag.into(),
            tx,
        }
    }

    /// The tag (object name) this sink reports for
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Emits an event. Returns `false` if the state machine has stopped.
    pub fn emit(&self, event: E) -> bool {
        self.tx.send((self.tag.clone(), event)).is_ok()
    }
}

/// Events emitted by a connection
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The remote Open was received
    Open,
    /// The connection was closed, optionally with an error
    Close(Option<Error>),
    /// An error was observed on the connection
    Error(Error),
    /// The underlying transport was lost
    Disconnected(Option<Error>),
}

/// Events emitted by a session
#[derive(Debug)]
pub enum SessionEvent {
    /// The remote Begin was received
    Open,
    /// The session was ended, optionally with an error
    Close(Option<Error>),
    /// An error was observed on the session
    Error(Error),
}

/// Events emitted by a sender link
#[derive(Debug)]
pub enum SenderEvent {
    /// The remote Attach was received
    Open,
    /// The link was detached, optionally with an error
    Close(Option<Error>),
    /// An error was observed on the link. A `Close` always follows.
    Error(Error),
    /// The link has regained credit
    Sendable,
    /// The peer accepted a delivery
    Accepted(DeliveryId),
    /// The peer rejected a delivery
    Rejected(DeliveryId, Option<definitions::Error>),
    /// The peer released a delivery
    Released(DeliveryId),
}

/// Events emitted by a receiver link
#[derive(Debug)]
pub enum ReceiverEvent<D> {
    /// The remote Attach was received
    Open,
    /// The link was detached, optionally with an error
    Close(Option<Error>),
    /// An error was observed on the link. A `Close` always follows.
    Error(Error),
    /// A message arrived together with the handle used to settle it
    Message {
        /// The received message
        message: AmqpMessage,
        /// Handle used to settle the delivery
        delivery: D,
    },
}

/// Handle returned by [`SenderLink::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentDelivery {
    /// Delivery identifier echoed by `Accepted`/`Rejected`/`Released` events
    pub id: DeliveryId,
    /// Whether the delivery was settled as it was sent
    pub settled: bool,
}

/// Factory of connections
pub trait Transport: Send + 'static {
    /// Connection type produced by this transport
    type Connection: Connection;

    /// Opens a connection. Reconnection is never requested.
    fn open_connection(
        &mut self,
        params: TransportParameters,
        events: EventSink<ConnectionEvent>,
    ) -> Result<Self::Connection>;
}

/// An open (or opening) connection
pub trait Connection: Send + 'static {
    /// Session type produced by this connection
    type Session: Session;

    /// Creates and begins a session
    fn create_session(&mut self, events: EventSink<SessionEvent>) -> Result<Self::Session>;

    /// Starts a graceful close. Completion is reported with [`ConnectionEvent::Close`].
    fn close(&mut self);

    /// Tears the connection down locally without waiting for the peer
    fn remove(&mut self);
}

/// A session within a connection
pub trait Session: Send + 'static {
    /// Sender link type
    type Sender: SenderLink;

    /// Receiver link type
    type Receiver: ReceiverLink;

    /// Opens a sender link. The target address is carried in `options`.
    fn open_sender(
        &mut self,
        options: LinkOptions,
        events: EventSink<SenderEvent>,
    ) -> Result<Self::Sender>;

    /// Opens a receiver link. The source address is carried in `options`.
    fn open_receiver(
        &mut self,
        options: LinkOptions,
        events: EventSink<ReceiverEvent<<Self::Receiver as ReceiverLink>::Delivery>>,
    ) -> Result<Self::Receiver>;

    /// Starts a graceful end. Completion is reported with [`SessionEvent::Close`].
    fn close(&mut self);

    /// Tears the session down locally without waiting for the peer
    fn remove(&mut self);
}

/// Operations shared by both link roles
pub trait Link: Send + 'static {
    /// Starts a graceful detach. Completion is reported with a `Close` event.
    fn close(&mut self);

    /// Tears the link down locally without waiting for the peer
    fn remove(&mut self);
}

/// A sender link
pub trait SenderLink: Link {
    /// Whether the link currently has credit to send
    fn sendable(&self) -> bool;

    /// Sends a message
    fn send(&mut self, message: AmqpMessage) -> Result<SentDelivery>;
}

/// A receiver link
pub trait ReceiverLink: Link {
    /// Handle used to settle an incoming delivery
    type Delivery: Disposition;
}

/// Settlement operations of an incoming delivery
pub trait Disposition: Send + 'static {
    /// Settles with the accepted outcome
    fn accept(self);

    /// Settles with the rejected outcome
    fn reject(self, error: Option<definitions::Error>);

    /// Settles with the released outcome
    fn release(self);
}

pub(crate) type SessionOf<T> = <<T as Transport>::Connection as Connection>::Session;
pub(crate) type DeliveryOf<S> = <<S as Session>::Receiver as ReceiverLink>::Delivery;
