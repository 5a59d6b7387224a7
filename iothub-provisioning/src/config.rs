//! Timing configuration of the registration state machine

use std::time::Duration;

/// Polling interval used when the service does not supply one
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(2);

/// How long a registration request or status query may remain unanswered
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Timing of the register/poll loop
///
/// | Field | Default Value |
/// |-------|---------------|
/// |`polling_interval`| [`DEFAULT_POLLING_INTERVAL`] |
/// |`operation_timeout`| [`DEFAULT_OPERATION_TIMEOUT`] |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingConfig {
    /// Wait between two requests, unless the service supplies its own interval
    pub polling_interval: Duration,

    /// Watchdog on each registration request and status query
    pub operation_timeout: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            polling_interval: DEFAULT_POLLING_INTERVAL,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl PollingConfig {
    /// Sets the default polling interval
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Sets the operation timeout
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}
