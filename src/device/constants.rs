use std::time::Duration;
use uuid::Uuid;

/**
 * How long (milliseconds) a scan listens for advertisements, unless configured otherwise.
 */
pub const DEFAULT_DISCOVERY_TIMEOUT: u64 = 1000;

/**
 * How long (milliseconds) a connection attempt may take, unless configured otherwise.
 */
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10_000;

/**
 * How many notifications the router keeps around, unless configured otherwise.
 */
pub const DEFAULT_NOTIFICATION_RETENTION: usize = 256;

/**
 * Extra time (milliseconds) a transport gets on top of the discovery timeout to stop scanning and
 * report its results. After that, discovery counts as timed out.
 */
pub const DISCOVERY_GRACE: u64 = 2000;

/**
 * How long (milliseconds) unsubscribing and disconnecting may take during teardown.
 */
pub const TEARDOWN_DEADLINE: u64 = 5000;

/**
 * How long (milliseconds) a cancelled connect may still take to settle. A link it establishes in
 * that time is disconnected again, after that the call is abandoned.
 */
pub const CANCEL_GRACE: u64 = 1000;

/**
 * How often (milliseconds) an established link is checked for being alive.
 */
pub const LINK_POLL_DELAY: u64 = 1000;

/**
 * How long (milliseconds) checking if the peripheral is still connected may take
 */
pub const IS_CONNECTED_DEADLINE: u64 = 2000;

/**
 * The UUID of the Nordic UART service, the default service to scan for.
 */
pub const DEFAULT_SERVICE: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/**
 * The UUID of the Nordic UART TX characteristic, which pushes data to the central via notifications.
 */
pub const DEFAULT_NOTIFY_CHARACTERISTIC: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/**
 * The UUID of the Nordic UART RX characteristic, which the central writes to.
 */
pub const DEFAULT_WRITE_CHARACTERISTIC: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

pub fn make_default_service_uuid() -> Uuid {
    Uuid::parse_str(DEFAULT_SERVICE).unwrap()
}

pub fn make_default_characteristic_uuid() -> Uuid {
    Uuid::parse_str(DEFAULT_NOTIFY_CHARACTERISTIC).unwrap()
}

pub fn discovery_deadline(timeout: Duration) -> Duration {
    timeout + Duration::from_millis(DISCOVERY_GRACE)
}
