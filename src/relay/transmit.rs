use std::sync::Arc;

use bytes::Bytes;

use crate::session::transport::{TransportError, ViewerTransport};

/// Hook for reshaping a frame before it goes out, e.g. a transcode or
/// recompression stage. Nothing in the default configuration installs one;
/// frames are forwarded as captured.
pub trait FrameFilter: Send + Sync {
    fn apply(&self, frame: Bytes) -> Bytes;
}

/// Writes forwarded frames to the viewer. A send failure is a
/// loop-terminating I/O error for the caller, same as a read failure.
pub struct Transmitter {
    transport: Arc<dyn ViewerTransport>,
    filters: Vec<Box<dyn FrameFilter>>,
}

impl Transmitter {
    pub fn new(transport: Arc<dyn ViewerTransport>) -> Self {
        Self {
            transport,
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: Box<dyn FrameFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let frame = self
            .filters
            .iter()
            .fold(frame, |frame, filter| filter.apply(frame));
        self.transport.send_frame(frame).await
    }
}
