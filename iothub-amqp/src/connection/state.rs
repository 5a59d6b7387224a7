/// State of a [`ConnectionManager`](super::ConnectionManager)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection exists
    Disconnected,

    /// The connection is being opened
    Connecting,

    /// The connection is open and the session is being begun
    ConnectingSession,

    /// The connection and its session are open
    Connected,

    /// Links, session and connection are being torn down
    Disconnecting,
}

impl ConnectionState {
    /// Whether inputs are processed rather than deferred in this state
    pub(crate) fn is_stable(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Connected
        )
    }
}
