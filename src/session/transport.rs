use std::error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Write half of a viewer connection, injected into the session so the
/// lifecycle state machine can be exercised without a live network stack.
#[async_trait]
pub trait ViewerTransport: Send + Sync {
    /// Writes one forwarded frame as a single binary message.
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Writes a structured text notification.
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Closes the connection. Closing an already-closed transport is a
    /// no-op.
    async fn close(&self);

    async fn is_open(&self) -> bool;
}

#[derive(Debug)]
pub enum TransportError {
    Closed,
    Ws(tokio_tungstenite::tungstenite::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "viewer connection is closed"),
            TransportError::Ws(err) => write!(f, "viewer connection failed: {}", err),
        }
    }
}

impl error::Error for TransportError {}

/// Production transport over the sink half of a WebSocket connection.
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>,
    open: AtomicBool,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocketStream<TcpStream>, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
            open: AtomicBool::new(true),
        }
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        match self.sink.lock().await.send(message).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.open.store(false, Ordering::SeqCst);
                Err(TransportError::Ws(err))
            }
        }
    }
}

#[async_trait]
impl ViewerTransport for WsTransport {
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        self.send(Message::Binary(frame.to_vec())).await
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.send(Message::Text(text)).await
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.sink.lock().await.send(Message::Close(None)).await;
        }
    }

    async fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
