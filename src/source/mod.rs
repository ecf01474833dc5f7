pub mod mjpeg;
pub mod port;

use std::time::Duration;

/// Bounded retry policy for the two blocking waits on the upstream side:
/// waiting for the bridge to publish a streaming port, and waiting for the
/// stream server to accept a connection. The attempt count is the
/// authoritative ceiling.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub attempts: u32,
    pub delay: Duration,
}

impl Backoff {
    /// Port registry poll: every 500 ms, at most 120 attempts (60 s).
    pub const PORT_POLL: Backoff = Backoff {
        attempts: 120,
        delay: Duration::from_millis(500),
    };

    /// Stream connect retry: every 1 s, at most 20 attempts (20 s).
    pub const SOURCE_CONNECT: Backoff = Backoff {
        attempts: 20,
        delay: Duration::from_secs(1),
    };
}
