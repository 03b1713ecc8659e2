//! Channel layer limits and connection settings.

use core::time::Duration;

/// Initial receive window advertised for new channels, 1 MiB.
pub const DEFAULT_WINDOW: u32 = 1024 * 1024;

/// Maximum packet size advertised for new channels.
pub const DEFAULT_MAX_PACKET: u32 = 64 * 1024;

/// Advertised maximum packet size is never below this.
///
/// RFC4253 requires implementations to handle 32768 byte payloads.
pub const MIN_MAX_PACKET: u32 = 32 * 1024;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 10;

pub const DEFAULT_CHANNEL_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Number of "session" channels that may be open or opening at once.
pub const DEFAULT_MAX_SESSIONS: usize = 10;

/// Delay before retrying a socket read that failed with a resumable error.
pub const SOCKET_RETRY_DELAY: Duration = Duration::from_millis(30);

/// Channel events queued for the application before data events wait
/// for it to catch up.
pub const EVENT_QUEUE_LEN: usize = 32;

// Requests with want_reply that may await a success/failure at once.
// This can be increased, replies are matched in order.
pub const MAX_OUTSTANDING_REQS: usize = 8;

/// Settings shared by all channels of a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Number of `SSH_MSG_CHANNEL_OPEN` attempts a session channel makes
    /// before giving up.
    pub retry_attempts: u32,

    /// How long `close()` waits for the peer's `SSH_MSG_CHANNEL_CLOSE`.
    pub channel_close_timeout: Duration,

    pub initial_window_size: u32,

    /// Requested maximum packet size, see [`local_packet_size()`](Self::local_packet_size).
    pub max_packet_size: u32,

    /// Capacity of the session admission semaphore
    pub max_sessions: usize,
}

impl ConnectionInfo {
    /// The maximum packet size advertised to the peer
    pub fn local_packet_size(&self) -> u32 {
        self.max_packet_size.max(MIN_MAX_PACKET)
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            channel_close_timeout: DEFAULT_CHANNEL_CLOSE_TIMEOUT,
            initial_window_size: DEFAULT_WINDOW,
            max_packet_size: DEFAULT_MAX_PACKET,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}
