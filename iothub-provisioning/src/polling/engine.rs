use std::{collections::VecDeque, future::Future, sync::Arc};

use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};

use crate::{
    config::PollingConfig,
    error::{Error, Result},
    transport::{PollingTransport, RegistrationRequest, TransportReply},
    util::{respond, Responder, Running, Timer},
};

use super::{Control, PollingState, Registration};

/// Identifies one transport call. Replies carrying any other ticket are stale.
type Ticket = u64;

#[derive(Debug)]
enum Reply {
    Response(Result<TransportReply>),
    Cancelled(Result<()>),
    Disconnected(Result<()>),
}

/// The registration in flight
struct Attempt {
    request: RegistrationRequest,
    /// `None` re-sends the request when the polling interval elapses
    operation_id: Option<String>,
    responder: Responder<Registration>,
}

pub(crate) struct PollingEngine<T> {
    transport: Arc<T>,
    config: PollingConfig,
    state: PollingState,
    control: mpsc::UnboundedReceiver<Control>,
    deferred: VecDeque<Control>,

    reply_tx: mpsc::UnboundedSender<(Ticket, Reply)>,
    reply_rx: mpsc::UnboundedReceiver<(Ticket, Reply)>,
    next_ticket: Ticket,
    current: Option<Ticket>,

    attempt: Option<Attempt>,
    timeout: Timer,
    poll_timer: Timer,
    cancel_waiters: Vec<Responder<()>>,
    disconnect_waiter: Option<Responder<()>>,
}

impl<T: PollingTransport> PollingEngine<T> {
    pub fn new(
        transport: T,
        config: PollingConfig,
        control: mpsc::UnboundedReceiver<Control>,
    ) -> Self {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Self {
            transport: Arc::new(transport),
            config,
            state: PollingState::Disconnected,
            control,
            deferred: VecDeque::new(),
            reply_tx,
            reply_rx,
            next_ticket: 0,
            current: None,
            attempt: None,
            timeout: Timer::default(),
            poll_timer: Timer::default(),
            cancel_waiters: Vec::new(),
            disconnect_waiter: None,
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
                    None => Running::Stop,
                },
                Some((ticket, reply)) = self.reply_rx.recv() => {
                    self.on_reply(ticket, reply);
                    Running::Continue
                },
                _ = &mut self.timeout => {
                    self.on_timeout();
                    Running::Continue
                },
                _ = &mut self.poll_timer => {
                    self.on_poll_timer();
                    Running::Continue
                },
            };

            if let Running::Stop = running {
                break;
            }
        }

        if let Some(attempt) = self.attempt.take() {
            respond(attempt.responder, Err(Error::OperationCancelled));
        }
        debug!(state = ?self.state, "polling engine stopped");
    }

    fn set_state(&mut self, state: PollingState) {
        trace!(from = ?self.state, to = ?state, "polling state");
        self.state = state;
    }

    #[instrument(skip_all, fields(control = ?control, state = ?self.state))]
    fn on_control(&mut self, control: Control) {
        match control {
            Control::State(tx) => {
                let _ = tx.send(self.state);
            }
            Control::Register(request, responder) => match self.state {
                PollingState::Disconnected | PollingState::Idle => {
                    self.register(request, responder)
                }
                PollingState::Cancelling | PollingState::Disconnecting => {
                    self.deferred.push_back(Control::Register(request, responder))
                }
                _ => respond(responder, Err(Error::OperationInProgress)),
            },
            Control::Cancel(responder) => match self.state {
                PollingState::Disconnected | PollingState::Idle => respond(responder, Ok(())),
                PollingState::Cancelling => self.cancel_waiters.push(responder),
                PollingState::Disconnecting => self.deferred.push_back(Control::Cancel(responder)),
                _ => {
                    self.cancel_waiters.push(responder);
                    self.begin_cancel(Error::OperationCancelled);
                }
            },
            Control::Disconnect(responder) => match self.state {
                PollingState::Disconnected => respond(responder, Ok(())),
                // An earlier registration may have left the transport connected
                PollingState::Idle => self.begin_disconnect(responder),
                PollingState::Cancelling | PollingState::Disconnecting => {
                    self.deferred.push_back(Control::Disconnect(responder))
                }
                _ => {
                    // Runs again once the cancel has settled in `Idle`
                    self.begin_cancel(Error::OperationCancelled);
                    self.deferred.push_front(Control::Disconnect(responder));
                }
            },
        }
    }

    fn register(&mut self, request: RegistrationRequest, responder: Responder<Registration>) {
        debug!(registration_id = %request.registration_id, "registering");
        self.attempt = Some(Attempt {
            request,
            operation_id: None,
            responder,
        });
        self.send_registration_request();
    }

    fn send_registration_request(&mut self) {
        let Some(request) = self.attempt.as_ref().map(|a| a.request.clone()) else {
            return;
        };
        self.set_state(PollingState::SendingRegistrationRequest);
        self.timeout.arm(self.config.operation_timeout);
        self.call(move |transport| async move {
            Reply::Response(transport.registration_request(&request).await)
        });
    }

    fn query_operation_status(&mut self, operation_id: String) {
        let Some(request) = self.attempt.as_ref().map(|a| a.request.clone()) else {
            return;
        };
        self.set_state(PollingState::Polling);
        self.timeout.arm(self.config.operation_timeout);
        self.call(move |transport| async move {
            Reply::Response(
                transport
                    .query_operation_status(&request, &operation_id)
                    .await,
            )
        });
    }

    /// Runs a transport call on its own task and makes it the current one
    fn call<F, Fut>(&mut self, call: F)
    where
        F: FnOnce(Arc<T>) -> Fut,
        Fut: Future<Output = Reply> + Send + 'static,
    {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.current = Some(ticket);

        let replies = self.reply_tx.clone();
        let reply = call(self.transport.clone());
        tokio::spawn(async move {
            let _ = replies.send((ticket, reply.await));
        });
    }

    fn on_reply(&mut self, ticket: Ticket, reply: Reply) {
        if self.current != Some(ticket) {
            debug!(ticket, ?reply, "reply for an operation that is no longer current");
            return;
        }
        self.current = None;

        match reply {
            Reply::Response(result) => {
                self.timeout.cancel();
                self.set_state(PollingState::ResponseReceived);
                self.on_response(result);
            }
            Reply::Cancelled(result) => {
                if let Err(error) = result {
                    warn!(?error, "transport cancel failed");
                }
                self.set_state(PollingState::Idle);
                for responder in self.cancel_waiters.drain(..) {
                    respond(responder, Ok(()));
                }
                self.replay_deferred();
            }
            Reply::Disconnected(result) => {
                self.set_state(PollingState::Disconnected);
                if let Some(responder) = self.disconnect_waiter.take() {
                    respond(responder, result);
                }
                self.replay_deferred();
            }
        }
    }

    fn on_response(&mut self, result: Result<TransportReply>) {
        let TransportReply {
            result,
            response,
            polling_interval,
        } = match result {
            Ok(reply) => reply,
            Err(error) => return self.complete(Err(error)),
        };
        let interval = polling_interval.unwrap_or(self.config.polling_interval);

        trace!(status = %result.status, "registration status");
        match result.status.to_ascii_lowercase().as_str() {
            "registering" => self.wait_to_poll(None, interval),
            "assigning" => match result.operation_id.clone() {
                Some(operation_id) => self.wait_to_poll(Some(operation_id), interval),
                None => self.complete(Err(Error::Syntax {
                    status: result.status.clone(),
                    result: Box::new(result),
                    response,
                })),
            },
            "assigned" => self.complete(Ok(Registration { result, response })),
            "failed" => self.complete(Err(Error::DeviceRegistrationFailed {
                result: Box::new(result),
                response,
            })),
            _ => self.complete(Err(Error::Syntax {
                status: result.status.clone(),
                result: Box::new(result),
                response,
            })),
        }
    }

    fn wait_to_poll(&mut self, operation_id: Option<String>, interval: std::time::Duration) {
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.operation_id = operation_id;
        }
        self.set_state(PollingState::WaitingToPoll);
        self.poll_timer.arm(interval);
    }

    fn on_poll_timer(&mut self) {
        if self.state != PollingState::WaitingToPoll {
            return;
        }
        match self.attempt.as_ref().and_then(|a| a.operation_id.clone()) {
            Some(operation_id) => self.query_operation_status(operation_id),
            None => self.send_registration_request(),
        }
    }

    fn on_timeout(&mut self) {
        if !matches!(
            self.state,
            PollingState::SendingRegistrationRequest | PollingState::Polling
        ) {
            return;
        }
        warn!(timeout = ?self.config.operation_timeout, "registration operation timed out");
        self.begin_cancel(Error::Timeout(format!(
            "no response within {:?}",
            self.config.operation_timeout
        )));
    }

    fn complete(&mut self, result: Result<Registration>) {
        let settled = match result {
            Ok(_) => PollingState::ResponseComplete,
            Err(_) => PollingState::ResponseError,
        };
        self.set_state(settled);
        if let Some(attempt) = self.attempt.take() {
            respond(attempt.responder, result);
        }
        self.set_state(PollingState::Idle);
        self.replay_deferred();
    }

    /// The caller is failed right away, not when the transport cancel completes
    fn begin_cancel(&mut self, error: Error) {
        self.timeout.cancel();
        self.poll_timer.cancel();
        self.set_state(PollingState::Cancelling);
        if let Some(attempt) = self.attempt.take() {
            respond(attempt.responder, Err(error));
        }
        self.call(|transport| async move { Reply::Cancelled(transport.cancel().await) });
    }

    fn begin_disconnect(&mut self, responder: Responder<()>) {
        self.timeout.cancel();
        self.poll_timer.cancel();
        self.set_state(PollingState::Disconnecting);
        self.disconnect_waiter = Some(responder);
        self.call(|transport| async move { Reply::Disconnected(transport.disconnect().await) });
    }

    fn replay_deferred(&mut self) {
        while self.state.is_stable() {
            match self.deferred.pop_front() {
                Some(control) => self.on_control(control),
                None => break,
            }
        }
    }
}
