//! Link lifecycle shared by the sender and receiver endpoints

use tracing::{debug, trace};

use crate::{
    error::Result,
    transport::{DeliveryOf, EventTx, Link, ReceiverEvent, SenderEvent, Session},
    util::{respond, unique_name, Responder},
    Error,
};

use super::{options::Role, LinkOptions};

/// Link state.
///
/// `Detaching` always returns to `Detached`, whatever the outcome of the close handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No underlying link exists
    Detached,

    /// An attach has been sent and the remote attach is awaited
    Attaching,

    /// The link is attached
    Attached,

    /// A detach has been sent and the remote detach is awaited
    Detaching,
}

/// What a lifecycle input did to the link
#[derive(Debug)]
pub(crate) enum Transition {
    None,
    Attached,
    Detached {
        error: Option<Error>,
        /// Whether some caller already received `error`
        reported: bool,
    },
}

/// Borrowed pieces of the owning engine a link needs to (re)attach
pub(crate) struct LinkContext<'a, S: Session> {
    pub session: Option<&'a mut S>,
    pub sender_events: &'a EventTx<SenderEvent>,
    pub receiver_events: &'a EventTx<ReceiverEvent<DeliveryOf<S>>>,
}

#[derive(Debug)]
pub(crate) struct LinkCore<L> {
    role: Role,
    address: String,
    options: LinkOptions,
    state: LinkState,
    link: Option<L>,
    /// Name of the current attach attempt, used to match incoming events
    name: Option<String>,
    close_received: bool,
    error_before_close: Option<Error>,
    detach_error: Option<Error>,
    attach_waiters: Vec<Responder<()>>,
    detach_waiters: Vec<Responder<()>>,
}

impl<L: Link> LinkCore<L> {
    pub fn new(role: Role, address: String, options: LinkOptions) -> Self {
        Self {
            role,
            address,
            options,
            state: LinkState::Detached,
            link: None,
            name: None,
            close_received: false,
            error_before_close: None,
            detach_error: None,
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_current(&self, tag: &str) -> bool {
        self.name.as_deref() == Some(tag)
    }

    pub fn link_mut(&mut self) -> Option<&mut L> {
        self.link.as_mut()
    }

    fn set_state(&mut self, state: LinkState) {
        trace!(
            role = self.role.as_str(),
            address = %self.address,
            from = ?self.state,
            to = ?state,
            "link state"
        );
        self.state = state;
    }

    pub fn attach<F>(&mut self, open: F, responder: Option<Responder<()>>) -> Transition
    where
        F: FnOnce(LinkOptions, String) -> Result<L>,
    {
        match self.state {
            LinkState::Detached => {
                // Names are never reused across attach attempts
                let name = unique_name(self.role.as_str());
                let options = self.options.for_attach(self.role, &self.address, name.clone());
                match open(options, name.clone()) {
                    Ok(link) => {
                        self.link = Some(link);
                        self.name = Some(name);
                        self.attach_waiters.extend(responder);
                        self.set_state(LinkState::Attaching);
                        Transition::None
                    }
                    Err(error) => {
                        debug!(address = %self.address, ?error, "failed to open link");
                        let reported = responder.is_some();
                        if let Some(responder) = responder {
                            respond(responder, Err(error.clone()));
                        }
                        Transition::Detached {
                            error: Some(error),
                            reported,
                        }
                    }
                }
            }
            LinkState::Attaching => {
                self.attach_waiters.extend(responder);
                Transition::None
            }
            LinkState::Attached => {
                if let Some(responder) = responder {
                    respond(responder, Ok(()));
                }
                Transition::None
            }
            LinkState::Detaching => {
                if let Some(responder) = responder {
                    respond(responder, Err(Error::LinkDetached));
                }
                Transition::None
            }
        }
    }

    pub fn on_open(&mut self) -> Transition {
        match self.state {
            LinkState::Attaching => {
                self.set_state(LinkState::Attached);
                for responder in self.attach_waiters.drain(..) {
                    respond(responder, Ok(()));
                }
                Transition::Attached
            }
            _ => Transition::None,
        }
    }

    /// Errors always precede a close, so they are only recorded here
    pub fn on_error(&mut self, error: Error) {
        debug!(address = %self.address, ?error, "link error");
        self.error_before_close = Some(error);
    }

    pub fn on_close(&mut self, error: Option<Error>) -> Transition {
        self.close_received = true;
        let error = error.or_else(|| self.error_before_close.take());
        match self.state {
            LinkState::Attaching => {
                let error = error.unwrap_or(Error::LinkDetached);
                let reported = self.fail_attach_waiters(&error);
                self.link = None;
                self.finish();
                Transition::Detached {
                    error: Some(error),
                    reported,
                }
            }
            LinkState::Attached => {
                // Detached by the peer
                if let Some(mut link) = self.link.take() {
                    link.remove();
                }
                self.finish();
                Transition::Detached {
                    error,
                    reported: false,
                }
            }
            LinkState::Detaching => {
                self.link = None;
                let error = self.detach_error.take().or(error);
                let reported = self.complete_detach_waiters(&error);
                self.finish();
                Transition::Detached { error, reported }
            }
            LinkState::Detached => Transition::None,
        }
    }

    pub fn detach(&mut self, error: Option<Error>, responder: Option<Responder<()>>) -> Transition {
        match self.state {
            LinkState::Detached => {
                if let Some(responder) = responder {
                    respond(responder, error.map_or(Ok(()), Err));
                }
                Transition::None
            }
            LinkState::Attaching => {
                let attach_error = error.clone().unwrap_or(Error::UnexpectedDetach);
                self.fail_attach_waiters(&attach_error);
                self.begin_detach(error, responder)
            }
            LinkState::Attached => self.begin_detach(error, responder),
            LinkState::Detaching => {
                self.detach_waiters.extend(responder);
                Transition::None
            }
        }
    }

    fn begin_detach(&mut self, error: Option<Error>, responder: Option<Responder<()>>) -> Transition {
        self.set_state(LinkState::Detaching);
        self.detach_error = error;
        self.detach_waiters.extend(responder);
        if let Some(link) = self.link.as_mut() {
            link.close();
        }
        if self.close_received {
            // The peer already closed, no reply will come
            self.link = None;
            let error = self.detach_error.take();
            let reported = self.complete_detach_waiters(&error);
            self.finish();
            return Transition::Detached { error, reported };
        }
        Transition::None
    }

    pub fn force_detach(&mut self, error: Option<Error>) -> Transition {
        if self.state == LinkState::Detached {
            return Transition::None;
        }
        if let Some(mut link) = self.link.take() {
            link.remove();
        }
        let error = error.or_else(|| self.detach_error.take());
        let attach_error = error.clone().unwrap_or(Error::LinkDetached);
        let mut reported = self.fail_attach_waiters(&attach_error);
        reported |= self.complete_detach_waiters(&error);
        self.finish();
        Transition::Detached { error, reported }
    }

    fn fail_attach_waiters(&mut self, error: &Error) -> bool {
        let reported = !self.attach_waiters.is_empty();
        for responder in self.attach_waiters.drain(..) {
            respond(responder, Err(error.clone()));
        }
        reported
    }

    fn complete_detach_waiters(&mut self, error: &Option<Error>) -> bool {
        let reported = !self.detach_waiters.is_empty() && error.is_some();
        for responder in self.detach_waiters.drain(..) {
            respond(responder, error.clone().map_or(Ok(()), Err));
        }
        reported
    }

    fn finish(&mut self) {
        self.set_state(LinkState::Detached);
        self.name = None;
        self.close_received = false;
        self.error_before_close = None;
        self.detach_error = None;
    }
}
