//! The register/poll state machine

use std::future::Future;

use tokio::sync::{mpsc, oneshot};

use crate::{
    config::PollingConfig,
    error::{Error, Result},
    transport::{PollingTransport, RegistrationRequest, RegistrationResult, ResponseInfo},
    util::Responder,
};

mod engine;
mod state;

use engine::PollingEngine;

pub use state::PollingState;

type ControlTx = mpsc::UnboundedSender<Control>;

pub(crate) enum Control {
    Register(RegistrationRequest, Responder<Registration>),
    Cancel(Responder<()>),
    Disconnect(Responder<()>),
    State(oneshot::Sender<PollingState>),
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Control::Register(request, _) => f
                .debug_tuple("Register")
                .field(&request.registration_id)
                .finish(),
            Control::Cancel(_) => f.write_str("Cancel"),
            Control::Disconnect(_) => f.write_str("Disconnect"),
            Control::State(_) => f.write_str("State"),
        }
    }
}

/// A completed registration
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    /// The final result, with status `assigned`
    pub result: RegistrationResult,
    /// The response that carried it
    pub response: ResponseInfo,
}

/// Handle to a registration state machine
///
/// At most one registration is in flight at a time. The service answers a registration
/// request with one of four statuses:
///
/// - `registering`: the same request is sent again after the polling interval
/// - `assigning`: the operation id is polled after the polling interval
/// - `assigned`: the registration completes
/// - `failed`: the registration fails with [`Error::DeviceRegistrationFailed`]
///
/// Each request and status query is guarded by [`PollingConfig::operation_timeout`]. An
/// operation that times out is cancelled and fails with [`Error::Timeout`].
///
/// # Example
///
/// ```rust,ignore
/// let provisioning = PollingStateMachine::new(transport);
/// let registration = provisioning.register(RegistrationRequest::new("device-1")).await?;
/// let hub = registration.result.registration_state.and_then(|s| s.assigned_hub);
/// provisioning.disconnect().await?;
/// ```
#[derive(Debug, Clone)]
pub struct PollingStateMachine {
    control: ControlTx,
}

impl PollingStateMachine {
    /// Spawns a state machine with the default timing on the current tokio runtime
    pub fn new<T: PollingTransport>(transport: T) -> Self {
        Self::with_config(transport, PollingConfig::default())
    }

    /// Spawns a state machine with a custom timing
    pub fn with_config<T: PollingTransport>(transport: T, config: PollingConfig) -> Self {
        let (control, rx) = mpsc::unbounded_channel();
        let engine = PollingEngine::new(transport, config, rx);
        tokio::spawn(engine.event_loop());
        Self { control }
    }

    /// Registers the device, polling until the service settles the registration.
    ///
    /// Fails with [`Error::OperationInProgress`] if another registration is in flight.
    pub fn register(
        &self,
        request: RegistrationRequest,
    ) -> impl Future<Output = Result<Registration>> + Send + 'static {
        submit(&self.control, |responder| Control::Register(request, responder))
    }

    /// Cancels the registration in flight, which fails with [`Error::OperationCancelled`].
    /// Completes immediately if there is none.
    pub fn cancel(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        submit(&self.control, Control::Cancel)
    }

    /// Cancels the registration in flight, if any, then disconnects the transport.
    ///
    /// From [`PollingState::Idle`] the transport is disconnected even though nothing is in
    /// flight, since an earlier registration may have left it connected. Only from
    /// [`PollingState::Disconnected`] does this complete without calling the transport.
    pub fn disconnect(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        submit(&self.control, Control::Disconnect)
    }

    /// Current state
    pub async fn state(&self) -> Result<PollingState> {
        let (tx, rx) = oneshot::channel();
        self.control.send(Control::State(tx))?;
        Ok(rx.await?)
    }
}

/// Submits a control when called, not when the returned future is first polled
fn submit<T: Send + 'static>(
    control: &ControlTx,
    build: impl FnOnce(Responder<T>) -> Control,
) -> impl Future<Output = Result<T>> + Send + 'static {
    let (tx, rx) = oneshot::channel();
    let sent = control.send(build(tx)).map_err(Error::from);
    async move {
        sent?;
        rx.await?
    }
}
