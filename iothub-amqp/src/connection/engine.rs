use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, trace, warn};

use crate::{
    cbs::{CbsAgent, CbsConfig, CbsState},
    config::ConnectionConfig,
    constants::DEFAULT_DISCONNECT_TIMEOUT,
    error::Result,
    link::{
        receiver::{ReceiverEndpoint, Settlement, Subscriber},
        sender::SenderEndpoint,
        LinkContext, LinkState, Role,
    },
    results::{
        Connected, Disconnected, MessageAbandoned, MessageCompleted, MessageRejected,
    },
    transport::{
        Connection, ConnectionEvent, DeliveryOf, EventRx, EventSink, EventTx, ReceiverEvent,
        SenderEvent, Session, SessionEvent, SessionOf, Transport,
    },
    util::{fire, respond, try_outcome, unique_name, Outcome, Responder, Running, Timer},
    Error,
};

use super::{
    control::{Control, DisconnectHandler, LinkErrorHandler, SettleResponder},
    ConnectionState,
};

/// Builds the [`LinkContext`] of an engine. A session is only lent out while connected,
/// so nothing can attach during a rundown.
macro_rules! link_context {
    ($engine:ident) => {
        LinkContext {
            session: match $engine.state {
                ConnectionState::Connected => $engine.session.as_mut(),
                _ => None,
            },
            sender_events: &$engine.sender_tx,
            receiver_events: &$engine.receiver_tx,
        }
    };
}

/// A caller waiting on a link attach or detach
struct PendingLinkOp {
    detach: bool,
    role: Role,
    endpoint: String,
    rx: oneshot::Receiver<Result<()>>,
    responder: Responder<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RundownStage {
    DetachingLinks,
    ClosingSession,
    ClosingConnection,
}

/// Progress of a disconnect
struct Rundown {
    stage: RundownStage,
    /// Set by the watchdog, skips every remaining round-trip
    forced: bool,
    close_sent: bool,
    detaches: Vec<oneshot::Receiver<Result<()>>>,
    first_error: Option<Error>,
}

impl Rundown {
    fn new() -> Self {
        Self {
            stage: RundownStage::DetachingLinks,
            forced: false,
            close_sent: false,
            detaches: Vec::new(),
            first_error: None,
        }
    }
}

pub(crate) struct ConnectionEngine<T: Transport> {
    transport: T,
    state: ConnectionState,
    control: mpsc::UnboundedReceiver<Control>,
    deferred: VecDeque<Control>,

    connection: Option<T::Connection>,
    connection_tag: Option<String>,
    connection_closed: bool,
    session: Option<SessionOf<T>>,
    session_tag: Option<String>,
    session_closed: bool,

    senders: HashMap<String, SenderEndpoint<SessionOf<T>>>,
    receivers: HashMap<String, ReceiverEndpoint<SessionOf<T>>>,
    pending: Vec<PendingLinkOp>,
    cbs: Option<CbsAgent<SessionOf<T>>>,
    cbs_config: CbsConfig,

    connect_waiter: Option<Responder<Connected>>,
    disconnect_waiters: Vec<Responder<Disconnected>>,
    /// Error that started the current rundown
    terminal_error: Option<Error>,
    rundown: Option<Rundown>,
    watchdog: Timer,
    disconnect_timeout: Duration,

    on_disconnect: Option<DisconnectHandler>,
    on_link_error: Option<LinkErrorHandler>,

    connection_tx: EventTx<ConnectionEvent>,
    connection_rx: EventRx<ConnectionEvent>,
    session_tx: EventTx<SessionEvent>,
    session_rx: EventRx<SessionEvent>,
    sender_tx: EventTx<SenderEvent>,
    sender_rx: EventRx<SenderEvent>,
    receiver_tx: EventTx<ReceiverEvent<DeliveryOf<SessionOf<T>>>>,
    receiver_rx: EventRx<ReceiverEvent<DeliveryOf<SessionOf<T>>>>,
}

impl<T: Transport> ConnectionEngine<T> {
    pub fn new(
        transport: T,
        control: mpsc::UnboundedReceiver<Control>,
        cbs_config: CbsConfig,
    ) -> Self {
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (sender_tx, sender_rx) = mpsc::unbounded_channel();
        let (receiver_tx, receiver_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            state: ConnectionState::Disconnected,
            control,
            deferred: VecDeque::new(),
            connection: None,
            connection_tag: None,
            connection_closed: false,
            session: None,
            session_tag: None,
            session_closed: false,
            senders: HashMap::new(),
            receivers: HashMap::new(),
            pending: Vec::new(),
            cbs: None,
            cbs_config,
            connect_waiter: None,
            disconnect_waiters: Vec::new(),
            terminal_error: None,
            rundown: None,
            watchdog: Timer::never(),
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            on_disconnect: None,
            on_link_error: None,
            connection_tx,
            connection_rx,
            session_tx,
            session_rx,
            sender_tx,
            sender_rx,
            receiver_tx,
            receiver_rx,
        }
    }

    pub async fn event_loop(mut self) {
        loop {
            let running = tokio::select! {
                control = self.control.recv() => match control {
                    Some(control) => {
                        self.on_control(control);
                        Running::Continue
                    }
                    // Every handle has been dropped
                    None => Running::Stop,
                },
                Some((tag, event)) = self.connection_rx.recv() => {
                    self.on_connection_event(tag, event);
                    Running::Continue
                },
                Some((tag, event)) = self.session_rx.recv() => {
                    self.on_session_event(tag, event);
                    Running::Continue
                },
                Some((tag, event)) = self.sender_rx.recv() => {
                    self.on_sender_event(tag, event);
                    Running::Continue
                },
                Some((tag, event)) = self.receiver_rx.recv() => {
                    self.on_receiver_event(tag, event);
                    Running::Continue
                },
                _ = &mut self.watchdog => {
                    self.on_watchdog();
                    Running::Continue
                },
                _ = fire(self.cbs.as_mut().map(|cbs| cbs.expiry_timer())) => {
                    if let Some(cbs) = self.cbs.as_mut() {
                        cbs.on_expiry_scan();
                    }
                    Running::Continue
                },
            };

            self.after_input();
            if let Running::Stop = running {
                break;
            }
        }

        self.shutdown();
    }

    fn set_state(&mut self, state: ConnectionState) {
        trace!(from = ?self.state, to = ?state, "connection state");
        self.state = state;
    }

    /* ------------------------------- controls ------------------------------- */

    #[instrument(skip_all, fields(control = ?control, state = ?self.state))]
    fn on_control(&mut self, control: Control) {
        let control = match control {
            Control::SetDisconnectHandler(handler) => {
                self.on_disconnect = Some(handler);
                return;
            }
            Control::SetLinkErrorHandler(handler) => {
                self.on_link_error = Some(handler);
                return;
            }
            Control::State(tx) => {
                let _ = tx.send(self.state);
                return;
            }
            control => control,
        };

        match self.state {
            ConnectionState::Disconnected => self.on_control_disconnected(control),
            ConnectionState::Connected => self.on_control_connected(control),
            ConnectionState::Disconnecting => match control {
                // Joins the rundown in progress
                Control::Disconnect(responder) => self.disconnect_waiters.push(responder),
                control => self.deferred.push_back(control),
            },
            ConnectionState::Connecting | ConnectionState::ConnectingSession => {
                self.deferred.push_back(control)
            }
        }
    }

    fn on_control_disconnected(&mut self, control: Control) {
        match control {
            Control::Connect(config, responder) => self.connect(config, responder),
            Control::Disconnect(responder) => respond(responder, Ok(Disconnected)),
            Control::InitializeCbs(responder) => {
                respond(responder, Err(Error::not_connected("initializing cbs")))
            }
            Control::PutToken { responder, .. } => {
                respond(responder, Err(Error::not_connected("put-token")))
            }
            Control::Attach { responder, .. } => {
                respond(responder, Err(Error::not_connected("attaching a link")))
            }
            // Nothing is tracked while disconnected
            Control::Detach { responder, .. } => respond(responder, Ok(())),
            Control::Send { responder, .. } => {
                respond(responder, Err(Error::not_connected("sending a message")))
            }
            Control::Subscribe { responder, .. } => {
                respond(responder, Err(Error::not_connected("subscribing to a link")))
            }
            Control::Unsubscribe { .. } => {}
            Control::Settle { settlement, .. } => fail_settlement(settlement, Error::lock_lost()),
            Control::SetDisconnectHandler(_)
            | Control::SetLinkErrorHandler(_)
            | Control::State(_) => {}
        }
    }

    fn on_control_connected(&mut self, control: Control) {
        match control {
            Control::Connect(_, responder) => respond(responder, Ok(Connected)),
            Control::Disconnect(responder) => {
                self.disconnect_waiters.push(responder);
                self.begin_disconnect(None);
            }
            Control::InitializeCbs(responder) => {
                let mut ctx = link_context!(self);
                let cbs_config = &self.cbs_config;
                self.cbs
                    .get_or_insert_with(|| CbsAgent::new(cbs_config.clone()))
                    .attach(&mut ctx, Some(responder));
            }
            Control::PutToken {
                audience,
                token,
                responder,
            } => {
                let mut ctx = link_context!(self);
                let cbs_config = &self.cbs_config;
                self.cbs
                    .get_or_insert_with(|| CbsAgent::new(cbs_config.clone()))
                    .put_token(&mut ctx, audience, token, responder);
            }
            Control::Attach {
                role,
                endpoint,
                options,
                responder,
            } => {
                let (tx, rx) = oneshot::channel();
                let mut ctx = link_context!(self);
                match role {
                    Role::Sender => self
                        .senders
                        .entry(endpoint.clone())
                        .or_insert_with(|| SenderEndpoint::new(endpoint.clone(), options))
                        .attach(&mut ctx, Some(tx)),
                    Role::Receiver => self
                        .receivers
                        .entry(endpoint.clone())
                        .or_insert_with(|| ReceiverEndpoint::new(endpoint.clone(), options))
                        .attach(&mut ctx, Some(tx)),
                }
                self.pending.push(PendingLinkOp {
                    detach: false,
                    role,
                    endpoint,
                    rx,
                    responder,
                });
            }
            Control::Detach {
                role,
                endpoint,
                responder,
            } => {
                let (tx, rx) = oneshot::channel();
                let mut ctx = link_context!(self);
                let tracked = match role {
                    Role::Sender => self.senders.get_mut(&endpoint).map(|sender| {
                        sender.detach(&mut ctx, None, Some(tx));
                    }),
                    Role::Receiver => self.receivers.get_mut(&endpoint).map(|receiver| {
                        receiver.detach(&mut ctx, None, Some(tx));
                    }),
                };
                match tracked {
                    Some(()) => self.pending.push(PendingLinkOp {
                        detach: true,
                        role,
                        endpoint,
                        rx,
                        responder,
                    }),
                    None => respond(responder, Ok(())),
                }
            }
            Control::Send {
                endpoint,
                message,
                responder,
            } => {
                let mut ctx = link_context!(self);
                match self.senders.get_mut(&endpoint) {
                    Some(sender) => sender.send(&mut ctx, message, responder),
                    None => respond(responder, Err(not_tracked(Role::Sender, &endpoint))),
                }
            }
            Control::Subscribe {
                endpoint,
                tx,
                responder,
            } => {
                let mut ctx = link_context!(self);
                match self.receivers.get_mut(&endpoint) {
                    Some(receiver) => {
                        let id = receiver.next_subscriber_id();
                        receiver.subscribe(&mut ctx, Subscriber::Stream(id, tx));
                        respond(responder, Ok(id));
                    }
                    None => respond(responder, Err(not_tracked(Role::Receiver, &endpoint))),
                }
            }
            Control::Unsubscribe { endpoint, id } => {
                let mut ctx = link_context!(self);
                if let Some(receiver) = self.receivers.get_mut(&endpoint) {
                    receiver.unsubscribe(&mut ctx, id);
                }
            }
            Control::Settle {
                endpoint,
                token,
                settlement,
            } => match self.receivers.get_mut(&endpoint) {
                Some(receiver) => match settlement {
                    SettleResponder::Complete(responder) => respond(
                        responder,
                        receiver
                            .settle(token, Settlement::Complete)
                            .map(|()| MessageCompleted),
                    ),
                    SettleResponder::Reject(error, responder) => respond(
                        responder,
                        receiver
                            .settle(token, Settlement::Reject(error))
                            .map(|()| MessageRejected),
                    ),
                    SettleResponder::Abandon(responder) => respond(
                        responder,
                        receiver
                            .settle(token, Settlement::Abandon)
                            .map(|()| MessageAbandoned),
                    ),
                },
                None => fail_settlement(settlement, Error::lock_lost()),
            },
            Control::SetDisconnectHandler(_)
            | Control::SetLinkErrorHandler(_)
            | Control::State(_) => {}
        }
    }

    fn connect(&mut self, config: ConnectionConfig, responder: Responder<Connected>) {
        let params = config.transport_parameters();
        debug!(host = %params.host, port = params.port, "connecting");
        self.disconnect_timeout = config.disconnect_timeout;
        self.connection_closed = false;
        self.session_closed = false;
        self.connect_waiter = Some(responder);
        self.set_state(ConnectionState::Connecting);

        let tag = unique_name("connection");
        let events = EventSink::new(tag.clone(), self.connection_tx.clone());
        match self.transport.open_connection(params, events) {
            Ok(connection) => {
                self.connection = Some(connection);
                self.connection_tag = Some(tag);
            }
            Err(error) => self.connect_failed(Some(error)),
        }
    }

    fn connect_failed(&mut self, error: Option<Error>) {
        debug!(?error, "connect failed");
        if let Some(mut session) = self.session.take() {
            if !self.session_closed {
                session.remove();
            }
        }
        if let Some(mut connection) = self.connection.take() {
            if !self.connection_closed {
                connection.remove();
            }
        }
        self.session_tag = None;
        self.connection_tag = None;
        self.connection_closed = false;
        self.session_closed = false;
        self.set_state(ConnectionState::Disconnected);

        let error = error.unwrap_or_else(|| {
            Error::NotConnected(String::from("the connection closed before it was established"))
        });
        if let Some(responder) = self.connect_waiter.take() {
            respond(responder, Err(error));
        }
        self.replay_deferred();
    }

    fn replay_deferred(&mut self) {
        while self.state.is_stable() {
            match self.deferred.pop_front() {
                Some(control) => self.on_control(control),
                None => break,
            }
        }
    }

    /* -------------------------------- events -------------------------------- */

    #[instrument(skip_all, fields(state = ?self.state))]
    fn on_connection_event(&mut self, tag: String, event: ConnectionEvent) {
        if self.connection_tag.as_deref() != Some(tag.as_str()) {
            debug!(%tag, ?event, "event for a connection that is no longer current");
            return;
        }
        trace!(?event);

        match event {
            ConnectionEvent::Open => {
                if self.state == ConnectionState::Connecting {
                    self.create_session();
                }
            }
            ConnectionEvent::Error(error) => match self.state {
                ConnectionState::Connecting | ConnectionState::ConnectingSession => {
                    self.connect_failed(Some(error))
                }
                ConnectionState::Connected => self.begin_disconnect(Some(error)),
                ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                    debug!(?error, "connection error ignored")
                }
            },
            ConnectionEvent::Close(error) | ConnectionEvent::Disconnected(error) => {
                self.connection_closed = true;
                match self.state {
                    ConnectionState::Connecting | ConnectionState::ConnectingSession => {
                        self.connect_failed(error)
                    }
                    ConnectionState::Connected => {
                        self.begin_disconnect(Some(error.unwrap_or_else(closed_by_peer)))
                    }
                    ConnectionState::Disconnecting => {
                        if let Some(error) = error {
                            debug!(?error, "connection closed during disconnect");
                        }
                        // No link or session round-trip can complete any more
                        self.force_links();
                    }
                    ConnectionState::Disconnected => {}
                }
            }
        }
    }

    fn create_session(&mut self) {
        let tag = unique_name("session");
        let events = EventSink::new(tag.clone(), self.session_tx.clone());
        let created = match self.connection.as_mut() {
            Some(connection) => connection.create_session(events),
            None => Err(Error::not_connected("creating a session")),
        };
        match created {
            Ok(session) => {
                self.session = Some(session);
                self.session_tag = Some(tag);
                self.set_state(ConnectionState::ConnectingSession);
            }
            Err(error) => self.connect_failed(Some(error)),
        }
    }

    #[instrument(skip_all, fields(state = ?self.state))]
    fn on_session_event(&mut self, tag: String, event: SessionEvent) {
        if self.session_tag.as_deref() != Some(tag.as_str()) {
            debug!(%tag, ?event, "event for a session that is no longer current");
            return;
        }
        trace!(?event);

        match event {
            SessionEvent::Open => {
                if self.state == ConnectionState::ConnectingSession {
                    self.set_state(ConnectionState::Connected);
                    if let Some(responder) = self.connect_waiter.take() {
                        respond(responder, Ok(Connected));
                    }
                    self.replay_deferred();
                }
            }
            SessionEvent::Error(error) => match self.state {
                ConnectionState::Connecting | ConnectionState::ConnectingSession => {
                    self.connect_failed(Some(error))
                }
                ConnectionState::Connected => self.begin_disconnect(Some(error)),
                ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                    debug!(?error, "session error ignored")
                }
            },
            SessionEvent::Close(error) => {
                self.session_closed = true;
                match self.state {
                    ConnectionState::Connecting | ConnectionState::ConnectingSession => {
                        self.connect_failed(error)
                    }
                    ConnectionState::Connected => {
                        self.begin_disconnect(Some(error.unwrap_or_else(closed_by_peer)))
                    }
                    ConnectionState::Disconnecting => self.force_links(),
                    ConnectionState::Disconnected => {}
                }
            }
        }
    }

    fn on_sender_event(&mut self, tag: String, event: SenderEvent) {
        let mut ctx = link_context!(self);
        if let Some(cbs) = self.cbs.as_mut() {
            if cbs.owns_sender(&tag) {
                return cbs.on_sender_event(&mut ctx, event);
            }
        }
        match self.senders.values_mut().find(|sender| sender.is_current(&tag)) {
            Some(sender) => sender.on_event(&mut ctx, event),
            None => debug!(%tag, ?event, "event for a link that is no longer current"),
        }
    }

    fn on_receiver_event(&mut self, tag: String, event: ReceiverEvent<DeliveryOf<SessionOf<T>>>) {
        let mut ctx = link_context!(self);
        if let Some(cbs) = self.cbs.as_mut() {
            if cbs.owns_receiver(&tag) {
                return cbs.on_receiver_event(&mut ctx, event);
            }
        }
        match self.receivers.values_mut().find(|receiver| receiver.is_current(&tag)) {
            Some(receiver) => receiver.on_event(&mut ctx, event),
            // Dropping the delivery leaves it unsettled; the peer redelivers it
            None => debug!(%tag, "event for a link that is no longer current"),
        }
    }

    fn on_watchdog(&mut self) {
        if self.state != ConnectionState::Disconnecting {
            return;
        }
        warn!("graceful disconnect timed out, forcing teardown");
        if let Some(rundown) = self.rundown.as_mut() {
            rundown.forced = true;
        }
        self.force_links();
    }

    /// Runs after every input, whatever its source
    fn after_input(&mut self) {
        let mut ctx = link_context!(self);
        if let Some(cbs) = self.cbs.as_mut() {
            cbs.poll(&mut ctx);
        }
        self.poll_pending();
        self.report_link_errors();
        if self.state == ConnectionState::Disconnecting {
            self.advance_rundown();
        }
    }

    fn poll_pending(&mut self) {
        for mut op in std::mem::take(&mut self.pending) {
            let result = match try_outcome(&mut op.rx) {
                Outcome::Pending => {
                    self.pending.push(op);
                    continue;
                }
                Outcome::Done(result) => result,
            };
            // A failed attach and any detach stop tracking the endpoint
            if op.detach || result.is_err() {
                self.untrack(op.role, &op.endpoint);
            }
            respond(op.responder, result);
        }
    }

    fn untrack(&mut self, role: Role, endpoint: &str) {
        let detached = match role {
            Role::Sender => self
                .senders
                .get(endpoint)
                .map(|sender| sender.state() == LinkState::Detached),
            Role::Receiver => self
                .receivers
                .get(endpoint)
                .map(|receiver| receiver.state() == LinkState::Detached),
        };
        if detached == Some(true) {
            trace!(role = role.as_str(), %endpoint, "endpoint no longer tracked");
            match role {
                Role::Sender => {
                    self.senders.remove(endpoint);
                }
                Role::Receiver => {
                    self.receivers.remove(endpoint);
                }
            }
        }
    }

    /// Stops tracking every endpoint that detached with an error and hands the errors no
    /// caller received to the link error handler
    fn report_link_errors(&mut self) {
        let mut failed = Vec::new();
        let mut errors = Vec::new();
        for (endpoint, sender) in self.senders.iter_mut() {
            if sender.take_failed() {
                failed.push((Role::Sender, endpoint.clone()));
            }
            for error in sender.take_errors() {
                errors.push((endpoint.clone(), error));
            }
        }
        for (endpoint, receiver) in self.receivers.iter_mut() {
            if receiver.take_failed() {
                failed.push((Role::Receiver, endpoint.clone()));
            }
            for error in receiver.take_errors() {
                errors.push((endpoint.clone(), error));
            }
        }

        for (role, endpoint) in failed {
            self.untrack(role, &endpoint);
        }
        for (endpoint, error) in errors {
            if self.state != ConnectionState::Connected {
                // Reported through the disconnect instead
                debug!(%endpoint, ?error, "link error during teardown");
                continue;
            }
            match self.on_link_error.as_mut() {
                Some(handler) => handler(&endpoint, error),
                None => warn!(%endpoint, ?error, "unhandled link error"),
            }
        }
    }

    /* ------------------------------- teardown ------------------------------- */

    fn begin_disconnect(&mut self, trigger: Option<Error>) {
        debug!(?trigger, "disconnecting");
        self.set_state(ConnectionState::Disconnecting);
        self.terminal_error = trigger;
        self.watchdog.arm(self.disconnect_timeout);
        self.rundown = Some(Rundown::new());

        if self.connection_closed || self.session_closed {
            return self.force_links();
        }

        let error = self.terminal_error.clone();
        let mut detaches = Vec::new();
        let mut ctx = link_context!(self);
        if let Some(cbs) = self.cbs.as_mut() {
            let (tx, rx) = oneshot::channel();
            cbs.detach(&mut ctx, Some(tx));
            detaches.push(rx);
        }
        for sender in self.senders.values_mut() {
            let (tx, rx) = oneshot::channel();
            sender.detach(&mut ctx, error.clone(), Some(tx));
            detaches.push(rx);
        }
        for receiver in self.receivers.values_mut() {
            let (tx, rx) = oneshot::channel();
            receiver.detach(&mut ctx, error.clone(), Some(tx));
            detaches.push(rx);
        }
        if let Some(rundown) = self.rundown.as_mut() {
            rundown.detaches = detaches;
        }
    }

    /// Removes every link locally. Pending detaches complete with the terminal error.
    fn force_links(&mut self) {
        let error = self.terminal_error.clone();
        let mut ctx = link_context!(self);
        if let Some(cbs) = self.cbs.as_mut() {
            cbs.force_detach(&mut ctx, error.clone());
        }
        for sender in self.senders.values_mut() {
            sender.force_detach(&mut ctx, error.clone());
        }
        for receiver in self.receivers.values_mut() {
            receiver.force_detach(&mut ctx, error.clone());
        }
    }

    fn links_detached(&self) -> bool {
        self.cbs
            .as_ref()
            .map_or(true, |cbs| cbs.state() == CbsState::Detached)
            && self
                .senders
                .values()
                .all(|sender| sender.state() == LinkState::Detached)
            && self
                .receivers
                .values()
                .all(|receiver| receiver.state() == LinkState::Detached)
    }

    fn advance_rundown(&mut self) {
        let Some(mut rundown) = self.rundown.take() else {
            return;
        };

        loop {
            match rundown.stage {
                RundownStage::DetachingLinks => {
                    if !self.links_detached() {
                        break;
                    }
                    for rx in rundown.detaches.iter_mut() {
                        if let Outcome::Done(Err(error)) = try_outcome(rx) {
                            debug!(?error, "detach error during disconnect");
                            rundown.first_error.get_or_insert(error);
                        }
                    }
                    rundown.detaches.clear();

                    self.poll_pending();
                    for op in self.pending.drain(..) {
                        respond(op.responder, Err(Error::LinkDetached));
                    }
                    self.senders.clear();
                    self.receivers.clear();
                    self.cbs = None;
                    rundown.stage = RundownStage::ClosingSession;
                }
                RundownStage::ClosingSession => {
                    let graceful =
                        !(rundown.forced || self.session_closed || self.connection_closed);
                    if let (true, Some(session)) = (graceful, self.session.as_mut()) {
                        if !rundown.close_sent {
                            session.close();
                            rundown.close_sent = true;
                        }
                        break;
                    }
                    if let Some(mut session) = self.session.take() {
                        if !self.session_closed {
                            session.remove();
                        }
                    }
                    self.session_tag = None;
                    rundown.stage = RundownStage::ClosingConnection;
                    rundown.close_sent = false;
                }
                RundownStage::ClosingConnection => {
                    let graceful = !(rundown.forced || self.connection_closed);
                    if let (true, Some(connection)) = (graceful, self.connection.as_mut()) {
                        if !rundown.close_sent {
                            connection.close();
                            rundown.close_sent = true;
                        }
                        break;
                    }
                    if let Some(mut connection) = self.connection.take() {
                        if !self.connection_closed {
                            connection.remove();
                        }
                    }
                    self.connection_tag = None;
                    return self.finish_disconnect(rundown.first_error);
                }
            }
        }

        self.rundown = Some(rundown);
    }

    fn finish_disconnect(&mut self, rundown_error: Option<Error>) {
        self.watchdog.cancel();
        self.connection_closed = false;
        self.session_closed = false;
        self.set_state(ConnectionState::Disconnected);

        // A trigger error wins over anything the rundown produced
        let error = self.terminal_error.take().or(rundown_error);
        debug!(?error, "disconnected");
        if self.disconnect_waiters.is_empty() {
            match self.on_disconnect.as_mut() {
                Some(handler) => handler(error),
                None => {
                    if let Some(error) = error {
                        warn!(?error, "unhandled disconnect");
                    }
                }
            }
        } else {
            for responder in self.disconnect_waiters.drain(..) {
                respond(responder, error.clone().map_or(Ok(Disconnected), Err));
            }
        }
        self.replay_deferred();
    }

    /// Every handle is gone. Tears everything down locally.
    fn shutdown(&mut self) {
        debug!(state = ?self.state, "connection engine stopping");
        self.set_state(ConnectionState::Disconnecting);
        self.force_links();
        self.cbs = None;
        self.senders.clear();
        self.receivers.clear();
        if let Some(mut session) = self.session.take() {
            if !self.session_closed {
                session.remove();
            }
        }
        if let Some(mut connection) = self.connection.take() {
            if !self.connection_closed {
                connection.remove();
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

fn closed_by_peer() -> Error {
    Error::NotConnected(String::from("the connection was closed by the peer"))
}

fn not_tracked(role: Role, endpoint: &str) -> Error {
    Error::NotConnected(format!("no {} link is attached to {}", role.as_str(), endpoint))
}

fn fail_settlement(settlement: SettleResponder, error: Error) {
    match settlement {
        SettleResponder::Complete(responder) => respond(responder, Err(error)),
        SettleResponder::Reject(_, responder) => respond(responder, Err(error)),
        SettleResponder::Abandon(responder) => respond(responder, Err(error)),
    }
}
