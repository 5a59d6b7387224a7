//! Claims-based security agent
//!
//! The agent owns a sender and a receiver link on the `$cbs` node. Put-token requests
//! are correlated with their responses by message id, and requests that are not answered
//! within [`CbsConfig::put_token_timeout`] fail with [`Error::Timeout`].

use std::{collections::VecDeque, time::Duration};

use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, instrument, trace, warn};

use crate::{
    constants::{
        CBS_NODE_ADDR, DEFAULT_PUT_TOKEN_SCAN_INTERVAL, DEFAULT_PUT_TOKEN_TIMEOUT,
        DEFAULT_TOKEN_TYPE, PUT_TOKEN_SUCCESS,
    },
    link::{
        receiver::{ReceiverEndpoint, Settlement, Subscriber, SubscriberId},
        sender::SenderEndpoint,
        LinkContext, LinkOptions, LinkState,
    },
    results::{MessageEnqueued, SharedAccessSignatureUpdated},
    transport::{DeliveryOf, ReceiverEvent, SenderEvent, Session},
    util::{respond, try_outcome, Outcome, Responder, Timer},
    Error,
};

mod put_token;

use put_token::{
    put_token_message, OutstandingPutToken, OutstandingPutTokens, PutTokenRequest,
    PutTokenResponse,
};

/// Configuration of the claims-based security agent
#[derive(Debug, Clone)]
pub struct CbsConfig {
    /// How long a put-token request may remain unanswered
    pub put_token_timeout: Duration,

    /// Interval between two scans for expired put-token requests
    pub scan_interval: Duration,

    /// Value of the `type` application property of put-token requests
    pub token_type: String,
}

impl Default for CbsConfig {
    fn default() -> Self {
        Self {
            put_token_timeout: DEFAULT_PUT_TOKEN_TIMEOUT,
            scan_interval: DEFAULT_PUT_TOKEN_SCAN_INTERVAL,
            token_type: String::from(DEFAULT_TOKEN_TYPE),
        }
    }
}

/// State of the claims-based security agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbsState {
    /// Neither link is attached
    Detached,
    /// The sender, then the receiver, is being attached
    Attaching,
    /// Both links are attached
    Attached,
    /// Both links are being detached
    Detaching,
}

type AttachRx = oneshot::Receiver<crate::error::Result<()>>;
type SendRx = oneshot::Receiver<crate::error::Result<MessageEnqueued>>;

pub(crate) struct CbsAgent<S: Session> {
    state: CbsState,
    config: CbsConfig,
    sender: SenderEndpoint<S>,
    receiver: ReceiverEndpoint<S>,
    inbox: Option<SubscriberId>,
    sender_attach: Option<AttachRx>,
    receiver_attach: Option<AttachRx>,
    /// Error that aborted an attach, reported once both links are detached
    abort_error: Option<Error>,
    attach_waiters: Vec<Responder<()>>,
    detach_waiters: Vec<Responder<()>>,
    queued: VecDeque<PutTokenRequest>,
    outstanding: OutstandingPutTokens,
    /// Send completions keyed by the correlation id of their request
    sends: Vec<(String, SendRx)>,
    expiry: Timer,
}

impl<S: Session> CbsAgent<S> {
    pub fn new(config: CbsConfig) -> Self {
        Self {
            state: CbsState::Detached,
            config,
            sender: SenderEndpoint::new(CBS_NODE_ADDR, LinkOptions::default()),
            receiver: ReceiverEndpoint::new(CBS_NODE_ADDR, LinkOptions::default()),
            inbox: None,
            sender_attach: None,
            receiver_attach: None,
            abort_error: None,
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            queued: VecDeque::new(),
            outstanding: OutstandingPutTokens::default(),
            sends: Vec::new(),
            expiry: Timer::never(),
        }
    }

    pub fn state(&self) -> CbsState {
        self.state
    }

    pub fn expiry_timer(&mut self) -> &mut Timer {
        &mut self.expiry
    }

    pub fn owns_sender(&self, tag: &str) -> bool {
        self.sender.is_current(tag)
    }

    pub fn owns_receiver(&self, tag: &str) -> bool {
        self.receiver.is_current(tag)
    }

    fn set_state(&mut self, state: CbsState) {
        trace!(from = ?self.state, to = ?state, "cbs state");
        self.state = state;
    }

    pub fn attach(&mut self, ctx: &mut LinkContext<'_, S>, responder: Option<Responder<()>>) {
        match self.state {
            CbsState::Detached => {
                self.attach_waiters.extend(responder);
                self.begin_attach(ctx);
            }
            CbsState::Attaching => self.attach_waiters.extend(responder),
            CbsState::Attached => {
                if let Some(responder) = responder {
                    respond(responder, Ok(()));
                }
            }
            CbsState::Detaching => {
                if let Some(responder) = responder {
                    respond(responder, Err(Error::LinkDetached));
                }
            }
        }
    }

    fn begin_attach(&mut self, ctx: &mut LinkContext<'_, S>) {
        self.set_state(CbsState::Attaching);
        let (tx, rx) = oneshot::channel();
        self.sender_attach = Some(rx);
        self.sender.attach(ctx, Some(tx));
        self.poll(ctx);
    }

    pub fn put_token(
        &mut self,
        ctx: &mut LinkContext<'_, S>,
        audience: String,
        token: String,
        responder: Responder<SharedAccessSignatureUpdated>,
    ) {
        let request = PutTokenRequest {
            audience,
            token,
            responder,
        };
        match self.state {
            CbsState::Attached => self.send_put_token(ctx, request),
            CbsState::Attaching => self.queued.push_back(request),
            CbsState::Detached => {
                self.queued.push_back(request);
                self.begin_attach(ctx);
            }
            CbsState::Detaching => respond(request.responder, Err(Error::LinkDetached)),
        }
    }

    fn send_put_token(&mut self, ctx: &mut LinkContext<'_, S>, request: PutTokenRequest) {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let message = put_token_message(
            &self.config.token_type,
            &request.audience,
            request.token,
            &correlation_id,
        );
        self.outstanding.push(OutstandingPutToken {
            correlation_id: correlation_id.clone(),
            expires_at: Instant::now() + self.config.put_token_timeout,
            responder: request.responder,
        });
        debug!(
            audience = %request.audience,
            %correlation_id,
            outstanding = self.outstanding.len(),
            "put-token"
        );
        if !self.expiry.is_armed() {
            self.expiry.arm(self.config.scan_interval);
        }

        let (tx, rx) = oneshot::channel();
        self.sends.push((correlation_id, rx));
        self.sender.send(ctx, message, tx);
    }

    /// Gracefully detaches both links. Always ends `Detached`.
    pub fn detach(&mut self, ctx: &mut LinkContext<'_, S>, responder: Option<Responder<()>>) {
        match self.state {
            CbsState::Detached => {
                if let Some(responder) = responder {
                    respond(responder, Ok(()));
                }
            }
            CbsState::Attaching | CbsState::Attached => {
                self.detach_waiters.extend(responder);
                self.begin_detach(ctx, None);
            }
            CbsState::Detaching => self.detach_waiters.extend(responder),
        }
    }

    fn begin_detach(&mut self, ctx: &mut LinkContext<'_, S>, error: Option<Error>) {
        self.set_state(CbsState::Detaching);
        self.abort_error = error;
        self.sender_attach = None;
        self.receiver_attach = None;
        self.sender.detach(ctx, None, None);
        match self.inbox.take() {
            Some(id) => self.receiver.unsubscribe(ctx, id),
            None => self.receiver.detach(ctx, None, None),
        }
        self.poll(ctx);
    }

    /// Removes both links locally and fails every pending request
    pub fn force_detach(&mut self, ctx: &mut LinkContext<'_, S>, error: Option<Error>) {
        if self.state == CbsState::Detached {
            return;
        }
        self.sender.force_detach(ctx, error.clone());
        self.receiver.force_detach(ctx, error.clone());
        if let Some(id) = self.inbox.take() {
            self.receiver.unsubscribe(ctx, id);
        }
        self.sender_attach = None;
        self.receiver_attach = None;
        self.abort_error = error;
        self.finish_detach();
    }

    pub fn on_sender_event(&mut self, ctx: &mut LinkContext<'_, S>, event: SenderEvent) {
        self.sender.on_event(ctx, event);
        self.poll(ctx);
    }

    pub fn on_receiver_event(
        &mut self,
        ctx: &mut LinkContext<'_, S>,
        event: ReceiverEvent<DeliveryOf<S>>,
    ) {
        self.receiver.on_event(ctx, event);
        for received in self.receiver.take_inbox() {
            if let Err(error) = self.receiver.settle(received.lock_token(), Settlement::Complete) {
                debug!(?error, "failed to accept put-token response");
            }
            self.on_response(PutTokenResponse::from_message(received.message()));
        }
        self.poll(ctx);
    }

    fn on_response(&mut self, response: PutTokenResponse) {
        let Some(correlation_id) = response.correlation_id else {
            warn!("put-token response without a correlation id");
            return;
        };
        let Some(entry) = self.outstanding.remove(&correlation_id) else {
            debug!(%correlation_id, "put-token response for an unknown request");
            return;
        };
        let result = match response.status_code {
            Some(PUT_TOKEN_SUCCESS) => Ok(SharedAccessSignatureUpdated),
            status_code => Err(Error::Unauthorized {
                status_code,
                description: response.status_description,
            }),
        };
        respond(entry.responder, result);
        if self.outstanding.is_empty() {
            self.expiry.cancel();
        }
    }

    /// Fails the requests whose window has elapsed and re-arms the scan while any remain
    #[instrument(skip_all)]
    pub fn on_expiry_scan(&mut self) {
        for entry in self.outstanding.remove_expired(Instant::now()) {
            debug!(correlation_id = %entry.correlation_id, "put-token expired");
            respond(
                entry.responder,
                Err(Error::Timeout(String::from(
                    "no response to the put-token request",
                ))),
            );
        }
        if !self.outstanding.is_empty() {
            self.expiry.arm(self.config.scan_interval);
        }
    }

    /// Advances the attach and detach sequences and collects send failures.
    /// Called after every input that may have changed a link.
    pub fn poll(&mut self, ctx: &mut LinkContext<'_, S>) {
        self.poll_sends();
        // Link errors reach the pending requests through the detach below
        self.sender.take_failed();
        self.receiver.take_failed();
        let link_error = self
            .sender
            .take_errors()
            .into_iter()
            .chain(self.receiver.take_errors())
            .next();
        match self.state {
            CbsState::Attaching => self.poll_attach(ctx),
            CbsState::Attached => {
                if self.sender.state() == LinkState::Detached
                    || self.receiver.state() == LinkState::Detached
                {
                    warn!(error = ?link_error, "cbs link detached by the peer");
                    self.begin_detach(ctx, link_error);
                }
            }
            CbsState::Detaching => {
                if self.sender.state() == LinkState::Detached
                    && self.receiver.state() == LinkState::Detached
                {
                    self.finish_detach();
                }
            }
            CbsState::Detached => {}
        }
    }

    fn poll_attach(&mut self, ctx: &mut LinkContext<'_, S>) {
        if let Some(rx) = self.sender_attach.as_mut() {
            match try_outcome(rx) {
                Outcome::Pending => return,
                Outcome::Done(Ok(())) => {
                    self.sender_attach = None;
                    let (tx, rx) = oneshot::channel();
                    self.receiver_attach = Some(rx);
                    self.receiver.attach(ctx, Some(tx));
                    let id = self.receiver.next_subscriber_id();
                    self.receiver.subscribe(ctx, Subscriber::Inbox(id));
                    self.inbox = Some(id);
                }
                Outcome::Done(Err(error)) => return self.abort_attach(ctx, error),
            }
        }
        if let Some(rx) = self.receiver_attach.as_mut() {
            match try_outcome(rx) {
                Outcome::Pending => {}
                Outcome::Done(Ok(())) => {
                    self.receiver_attach = None;
                    self.set_state(CbsState::Attached);
                    for responder in self.attach_waiters.drain(..) {
                        respond(responder, Ok(()));
                    }
                    while let Some(request) = self.queued.pop_front() {
                        self.send_put_token(ctx, request);
                    }
                }
                Outcome::Done(Err(error)) => self.abort_attach(ctx, error),
            }
        }
    }

    fn abort_attach(&mut self, ctx: &mut LinkContext<'_, S>, error: Error) {
        warn!(?error, "failed to attach the cbs links");
        self.begin_detach(ctx, Some(error));
    }

    fn poll_sends(&mut self) {
        let mut failed = Vec::new();
        self.sends.retain_mut(|(correlation_id, rx)| match try_outcome(rx) {
            Outcome::Pending => true,
            Outcome::Done(Ok(_)) => false,
            Outcome::Done(Err(error)) => {
                failed.push((correlation_id.clone(), error));
                false
            }
        });
        for (correlation_id, error) in failed {
            if let Some(entry) = self.outstanding.remove(&correlation_id) {
                respond(entry.responder, Err(error));
            }
        }
        if self.outstanding.is_empty() {
            self.expiry.cancel();
        }
    }

    fn finish_detach(&mut self) {
        self.set_state(CbsState::Detached);
        self.expiry.cancel();
        self.sends.clear();
        let error = self.abort_error.take();
        let failure = error.clone().unwrap_or(Error::LinkDetached);
        for responder in self.attach_waiters.drain(..) {
            respond(responder, Err(failure.clone()));
        }
        for request in self.queued.drain(..) {
            respond(request.responder, Err(failure.clone()));
        }
        for entry in self.outstanding.drain() {
            respond(entry.responder, Err(failure.clone()));
        }
        for responder in self.detach_waiters.drain(..) {
            respond(responder, Ok(()));
        }
    }
}
