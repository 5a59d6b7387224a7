//! Receiver endpoint: undisposed delivery tracking and subscription counting

use std::{collections::VecDeque, sync::Arc};

use fe2o3_amqp_types::definitions;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::{
    error::Result,
    transport::{AmqpMessage, DeliveryOf, Disposition, EventSink, ReceiverEvent, Session},
    util::Responder,
    Error,
};

use super::{
    options::Role,
    state::{LinkContext, LinkCore, LinkState, Transition},
    LinkOptions,
};

/// Identity of a received message, used to settle it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockToken(u64);

/// A message delivered to a subscriber
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    lock_token: LockToken,
    message: Arc<AmqpMessage>,
}

impl ReceivedMessage {
    /// Token identifying the delivery for `complete`/`reject`/`abandon`
    pub fn lock_token(&self) -> LockToken {
        self.lock_token
    }

    /// The message
    pub fn message(&self) -> &AmqpMessage {
        &self.message
    }
}

pub(crate) type MessageTx = mpsc::UnboundedSender<Result<ReceivedMessage>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SubscriberId(pub u64);

/// Where the messages of a subscriber go
pub(crate) enum Subscriber {
    /// A [`MessageStream`](super::MessageStream) owned by a caller
    Stream(SubscriberId, MessageTx),
    /// Kept on the endpoint until taken by the owning state machine
    Inbox(SubscriberId),
}

impl Subscriber {
    fn id(&self) -> SubscriberId {
        match self {
            Subscriber::Stream(id, _) | Subscriber::Inbox(id) => *id,
        }
    }
}

/// Outcome requested for a received message
#[derive(Debug, Clone)]
pub(crate) enum Settlement {
    Complete,
    Reject(Option<definitions::Error>),
    Abandon,
}

pub(crate) enum ReceiverInput {
    Attach(Option<Responder<()>>),
    Detach(Option<Error>, Option<Responder<()>>),
    Subscribe(Subscriber),
    Unsubscribe(SubscriberId),
}

pub(crate) struct ReceiverEndpoint<S: Session> {
    core: LinkCore<S::Receiver>,
    undisposed: Vec<(LockToken, DeliveryOf<S>)>,
    subscribers: Vec<Subscriber>,
    inbox: VecDeque<ReceivedMessage>,
    next_lock_token: u64,
    next_subscriber_id: u64,
    deferred: VecDeque<ReceiverInput>,
    errors: Vec<Error>,
    /// Set when the link detaches with an error
    failed: bool,
}

impl<S: Session> ReceiverEndpoint<S> {
    pub fn new(address: impl Into<String>, options: LinkOptions) -> Self {
        Self {
            core: LinkCore::new(Role::Receiver, address.into(), options),
            undisposed: Vec::new(),
            subscribers: Vec::new(),
            inbox: VecDeque::new(),
            next_lock_token: 0,
            next_subscriber_id: 0,
            deferred: VecDeque::new(),
            errors: Vec::new(),
            failed: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.core.state()
    }

    pub fn is_current(&self, tag: &str) -> bool {
        self.core.is_current(tag)
    }

    /// Errors that no caller received
    pub fn take_errors(&mut self) -> Vec<Error> {
        std::mem::take(&mut self.errors)
    }

    /// Whether the link detached with an error since the last call
    pub fn take_failed(&mut self) -> bool {
        std::mem::take(&mut self.failed)
    }

    pub fn take_inbox(&mut self) -> VecDeque<ReceivedMessage> {
        std::mem::take(&mut self.inbox)
    }

    pub fn next_subscriber_id(&mut self) -> SubscriberId {
        self.next_subscriber_id += 1;
        SubscriberId(self.next_subscriber_id)
    }

    pub fn attach(&mut self, ctx: &mut LinkContext<'_, S>, responder: Option<Responder<()>>) {
        self.input(ctx, ReceiverInput::Attach(responder))
    }

    pub fn detach(
        &mut self,
        ctx: &mut LinkContext<'_, S>,
        error: Option<Error>,
        responder: Option<Responder<()>>,
    ) {
        self.input(ctx, ReceiverInput::Detach(error, responder))
    }

    /// The first subscriber attaches the link
    pub fn subscribe(&mut self, ctx: &mut LinkContext<'_, S>, subscriber: Subscriber) {
        self.input(ctx, ReceiverInput::Subscribe(subscriber))
    }

    /// Removing the last subscriber detaches the link
    pub fn unsubscribe(&mut self, ctx: &mut LinkContext<'_, S>, id: SubscriberId) {
        self.input(ctx, ReceiverInput::Unsubscribe(id))
    }

    pub fn force_detach(&mut self, ctx: &mut LinkContext<'_, S>, error: Option<Error>) {
        let transition = self.core.force_detach(error);
        self.apply(ctx, transition)
    }

    /// Settles a received message. Unknown tokens, and any token while the link is not
    /// attached, yield a lock lost error.
    pub fn settle(&mut self, token: LockToken, settlement: Settlement) -> Result<()> {
        if self.core.state() != LinkState::Attached {
            return Err(Error::lock_lost());
        }
        let position = self
            .undisposed
            .iter()
            .position(|(lock_token, _)| *lock_token == token)
            .ok_or_else(Error::lock_lost)?;
        let (_, delivery) = self.undisposed.remove(position);
        match settlement {
            Settlement::Complete => delivery.accept(),
            Settlement::Reject(error) => delivery.reject(error),
            Settlement::Abandon => delivery.release(),
        }
        Ok(())
    }

    #[instrument(skip_all, fields(address = %self.core.address()))]
    pub fn on_event(&mut self, ctx: &mut LinkContext<'_, S>, event: ReceiverEvent<DeliveryOf<S>>) {
        match event {
            ReceiverEvent::Open => {
                let transition = self.core.on_open();
                self.apply(ctx, transition)
            }
            ReceiverEvent::Close(error) => {
                let transition = self.core.on_close(error);
                self.apply(ctx, transition)
            }
            ReceiverEvent::Error(error) => self.core.on_error(error),
            ReceiverEvent::Message { message, delivery } => self.on_message(message, delivery),
        }
    }

    fn on_message(&mut self, message: AmqpMessage, delivery: DeliveryOf<S>) {
        if self.core.state() != LinkState::Attached {
            debug!("message received on a link that is not attached");
            return;
        }
        self.next_lock_token += 1;
        let lock_token = LockToken(self.next_lock_token);
        self.undisposed.push((lock_token, delivery));

        let received = ReceivedMessage {
            lock_token,
            message: Arc::new(message),
        };
        for subscriber in &self.subscribers {
            match subscriber {
                Subscriber::Stream(_, tx) => {
                    // A closed stream is already on its way to unsubscribe
                    let _ = tx.send(Ok(received.clone()));
                }
                Subscriber::Inbox(_) => self.inbox.push_back(received.clone()),
            }
        }
    }

    fn input(&mut self, ctx: &mut LinkContext<'_, S>, input: ReceiverInput) {
        if self.core.state() == LinkState::Detaching {
            self.deferred.push_back(input);
            return;
        }

        match input {
            ReceiverInput::Attach(responder) => {
                let transition = self.core.attach(
                    |options, name| match ctx.session.as_deref_mut() {
                        Some(session) => session.open_receiver(
                            options,
                            EventSink::new(name, ctx.receiver_events.clone()),
                        ),
                        None => Err(Error::not_connected("attaching a receiver link")),
                    },
                    responder,
                );
                self.apply(ctx, transition)
            }
            ReceiverInput::Detach(error, responder) => {
                let transition = self.core.detach(error, responder);
                self.apply(ctx, transition)
            }
            ReceiverInput::Subscribe(subscriber) => {
                self.subscribers.push(subscriber);
                if self.subscribers.len() == 1 {
                    self.input(ctx, ReceiverInput::Attach(None))
                }
            }
            ReceiverInput::Unsubscribe(id) => {
                let before = self.subscribers.len();
                self.subscribers.retain(|subscriber| subscriber.id() != id);
                if before > 0 && self.subscribers.is_empty() {
                    self.input(ctx, ReceiverInput::Detach(None, None))
                }
            }
        }
    }

    fn apply(&mut self, ctx: &mut LinkContext<'_, S>, transition: Transition) {
        match transition {
            Transition::None | Transition::Attached => {}
            Transition::Detached { error, reported } => {
                // Unsettled deliveries are redelivered by the peer
                self.undisposed.clear();
                let mut reported = reported;
                // Streams see the error, then end
                for subscriber in self.subscribers.drain(..) {
                    if let (Subscriber::Stream(_, tx), Some(error)) = (&subscriber, &error) {
                        reported |= tx.send(Err(error.clone())).is_ok();
                    }
                }
                if let Some(error) = error {
                    self.failed = true;
                    if !reported {
                        warn!(address = %self.core.address(), ?error, "receiver link detached");
                        self.errors.push(error);
                    }
                }
                self.replay(ctx);
            }
        }
    }

    fn replay(&mut self, ctx: &mut LinkContext<'_, S>) {
        while self.core.state() != LinkState::Detaching {
            match self.deferred.pop_front() {
                Some(input) => self.input(ctx, input),
                None => break,
            }
        }
    }
}
