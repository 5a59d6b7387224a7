//! Constants shared across the crate

use std::time::Duration;

/// Default AMQPS port
pub const DEFAULT_AMQPS_PORT: u16 = 5671;

/// Default AMQP port without TLS
pub const DEFAULT_AMQP_PORT: u16 = 5672;

/// Default max-frame-size
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 256 * 1024;

/// Default channel-max
pub const DEFAULT_CHANNEL_MAX: u16 = 255;

/// Time allowed for a graceful disconnect before the rundown is forced
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(45);

/// Connection property carrying the user agent string
pub const USER_AGENT_PROPERTY: &str = "com.microsoft:client-version";

/// Address of the CBS node
pub const CBS_NODE_ADDR: &str = "$cbs";

/// Reply-to address used by put-token requests
pub const CBS_REPLY_TO: &str = "cbs";

/// Put token operation
pub const PUT_TOKEN: &str = "put-token";

/// Default token type presented to the CBS node
pub const DEFAULT_TOKEN_TYPE: &str = "servicebus.windows.net:sastoken";

/// Application property key of the CBS operation
pub const OPERATION: &str = "operation";

/// Application property key of the token type
pub const TYPE: &str = "type";

/// Application property key of the token audience
pub const NAME: &str = "name";

/// Application property key of the put-token response status
pub const STATUS_CODE: &str = "status-code";

/// Application property key of the put-token response description
pub const STATUS_DESCRIPTION: &str = "status-description";

/// Status code of a successful put-token response
pub const PUT_TOKEN_SUCCESS: i64 = 200;

/// Lifetime of an outstanding put-token request
pub const DEFAULT_PUT_TOKEN_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval between two scans for expired put-token requests
pub const DEFAULT_PUT_TOKEN_SCAN_INTERVAL: Duration = Duration::from_secs(10);
