//! Sender endpoint: FIFO send queue on top of the link lifecycle

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, instrument, warn};

use crate::{
    results::MessageEnqueued,
    transport::{AmqpMessage, DeliveryId, EventSink, SenderEvent, SenderLink, Session},
    util::{respond, Responder},
    Error,
};

use super::{
    options::Role,
    state::{LinkContext, LinkCore, LinkState, Transition},
    LinkOptions,
};

pub(crate) enum SenderInput {
    Attach(Option<Responder<()>>),
    Detach(Option<Error>, Option<Responder<()>>),
    Send(AmqpMessage, Responder<MessageEnqueued>),
}

struct PendingSend {
    message: AmqpMessage,
    responder: Responder<MessageEnqueued>,
}

pub(crate) struct SenderEndpoint<S: Session> {
    core: LinkCore<S::Sender>,
    /// Messages not yet handed to the link, in call order
    unsent: VecDeque<PendingSend>,
    /// Sent but unsettled deliveries awaiting a disposition
    in_flight: BTreeMap<DeliveryId, Responder<MessageEnqueued>>,
    deferred: VecDeque<SenderInput>,
    errors: Vec<Error>,
    /// Set when the link detaches with an error
    failed: bool,
}

impl<S: Session> SenderEndpoint<S> {
    pub fn new(address: impl Into<String>, options: LinkOptions) -> Self {
        Self {
            core: LinkCore::new(Role::Sender, address.into(), options),
            unsent: VecDeque::new(),
            in_flight: BTreeMap::new(),
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

    pub fn attach(&mut self, ctx: &mut LinkContext<'_, S>, responder: Option<Responder<()>>) {
        self.input(ctx, SenderInput::Attach(responder))
    }

    pub fn detach(
        &mut self,
        ctx: &mut LinkContext<'_, S>,
        error: Option<Error>,
        responder: Option<Responder<()>>,
    ) {
        self.input(ctx, SenderInput::Detach(error, responder))
    }

    pub fn send(
        &mut self,
        ctx: &mut LinkContext<'_, S>,
        message: AmqpMessage,
        responder: Responder<MessageEnqueued>,
    ) {
        self.input(ctx, SenderInput::Send(message, responder))
    }

    pub fn force_detach(&mut self, ctx: &mut LinkContext<'_, S>, error: Option<Error>) {
        let transition = self.core.force_detach(error);
        self.apply(ctx, transition)
    }

    #[instrument(skip_all, fields(address = %self.core.address()))]
    pub fn on_event(&mut self, ctx: &mut LinkContext<'_, S>, event: SenderEvent) {
        match event {
            SenderEvent::Open => {
                let transition = self.core.on_open();
                self.apply(ctx, transition)
            }
            SenderEvent::Close(error) => {
                let transition = self.core.on_close(error);
                self.apply(ctx, transition)
            }
            SenderEvent::Error(error) => self.core.on_error(error),
            SenderEvent::Sendable => self.flush(ctx),
            SenderEvent::Accepted(id) => self.settle(id, Ok(MessageEnqueued)),
            SenderEvent::Rejected(id, error) => self.settle(id, Err(Error::Rejected(error))),
            SenderEvent::Released(id) => self.settle(id, Err(Error::Released)),
        }
    }

    fn input(&mut self, ctx: &mut LinkContext<'_, S>, input: SenderInput) {
        if self.core.state() == LinkState::Detaching {
            self.deferred.push_back(input);
            return;
        }

        match input {
            SenderInput::Attach(responder) => {
                let transition = self.core.attach(
                    |options, name| match ctx.session.as_deref_mut() {
                        Some(session) => session
                            .open_sender(options, EventSink::new(name, ctx.sender_events.clone())),
                        None => Err(Error::not_connected("attaching a sender link")),
                    },
                    responder,
                );
                self.apply(ctx, transition)
            }
            SenderInput::Detach(error, responder) => {
                let transition = self.core.detach(error, responder);
                self.apply(ctx, transition)
            }
            SenderInput::Send(message, responder) => {
                self.unsent.push_back(PendingSend { message, responder });
                self.flush(ctx)
            }
        }
    }

    fn flush(&mut self, ctx: &mut LinkContext<'_, S>) {
        match self.core.state() {
            LinkState::Attached => self.drain(),
            // The post-attach flush sends whatever is queued now
            LinkState::Detached if !self.unsent.is_empty() => {
                self.input(ctx, SenderInput::Attach(None))
            }
            _ => {}
        }
    }

    fn drain(&mut self) {
        let Some(link) = self.core.link_mut() else {
            return;
        };
        while link.sendable() {
            let Some(pending) = self.unsent.pop_front() else {
                break;
            };
            match link.send(pending.message) {
                Ok(delivery) if delivery.settled => respond(pending.responder, Ok(MessageEnqueued)),
                Ok(delivery) => {
                    self.in_flight.insert(delivery.id, pending.responder);
                }
                Err(error) => respond(pending.responder, Err(error)),
            }
        }
    }

    fn settle(&mut self, id: DeliveryId, result: Result<MessageEnqueued, Error>) {
        match self.in_flight.remove(&id) {
            Some(responder) => respond(responder, result),
            None => debug!(id, "disposition for an unknown delivery"),
        }
    }

    fn apply(&mut self, ctx: &mut LinkContext<'_, S>, transition: Transition) {
        match transition {
            Transition::None => {}
            Transition::Attached => self.flush(ctx),
            Transition::Detached { error, reported } => {
                let mut reported = reported;
                let failure = error.clone().unwrap_or(Error::LinkDetached);
                for pending in self.unsent.drain(..) {
                    respond(pending.responder, Err(failure.clone()));
                    reported = true;
                }
                for (_, responder) in std::mem::take(&mut self.in_flight) {
                    respond(responder, Err(failure.clone()));
                    reported = true;
                }
                if let Some(error) = error {
                    self.failed = true;
                    if !reported {
                        warn!(address = %self.core.address(), ?error, "sender link detached");
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
