use std::error;
use std::fmt;

use tokio::time;

use crate::registry::{DeviceId, PortRegistry};
use crate::source::Backoff;

/// Waits for the bridge to publish the streaming port for `device_id`,
/// polling the registry on the given backoff. The first present, non-zero
/// port short-circuits. Exhausting the attempt budget is a definitive
/// failure: the caller must not proceed to streaming.
pub async fn resolve(
    registry: &PortRegistry,
    device_id: &DeviceId,
    backoff: Backoff,
) -> Result<u16, PortResolveError> {
    for attempt in 0..backoff.attempts {
        match registry.port(device_id).await {
            Some(port) if port != 0 => {
                tracing::debug!(%device_id, port, attempt, "streaming port published");
                return Ok(port);
            }
            _ => {}
        }
        time::sleep(backoff.delay).await;
    }

    Err(PortResolveError::Timeout)
}

#[derive(Debug, PartialEq, Eq)]
pub enum PortResolveError {
    Timeout,
}

impl fmt::Display for PortResolveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PortResolveError::Timeout => write!(f, "streaming port was never published"),
        }
    }
}

impl error::Error for PortResolveError {}
