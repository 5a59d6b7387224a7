/// State of the registration state machine
///
/// `ResponseReceived`, `ResponseComplete` and `ResponseError` are passed through while a
/// response is being handled and are never observed between two inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingState {
    /// The transport is not connected
    Disconnected,

    /// Connected, nothing in flight
    Idle,

    /// A registration request is in flight
    SendingRegistrationRequest,

    /// A response is being dispatched on its status
    ResponseReceived,

    /// The registration completed
    ResponseComplete,

    /// The registration failed
    ResponseError,

    /// Waiting for the polling interval to elapse
    WaitingToPoll,

    /// An operation status query is in flight
    Polling,

    /// The transport is cancelling the in-flight request
    Cancelling,

    /// The transport is disconnecting
    Disconnecting,
}

impl PollingState {
    /// States in which a new registration may start and deferred inputs are replayed
    pub(crate) fn is_stable(&self) -> bool {
        matches!(self, PollingState::Disconnected | PollingState::Idle)
    }
}
