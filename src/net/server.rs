use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::app::handler::{AdmissionRequest, AppHandler};
use crate::runtime::task_manager::{Task, TaskContext};
use crate::runtime::Runtime;
use crate::session::session_manager::SessionManager;
use crate::session::transport::{ViewerTransport, WsTransport};

/// Accept loop for viewer WebSocket connections.
pub struct Server {
    local_addr: SocketAddr,
    worker: Task,
}

impl Server {
    pub async fn start(
        host: &str,
        port: u16,
        handler: AppHandler,
        sessions: Arc<SessionManager>,
        runtime: Arc<Runtime>,
    ) -> Result<Self, io::Error> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "listening for viewer connections");

        let handler = Arc::new(handler);
        let worker = runtime
            .task()
            .spawn({
                let runtime = runtime.clone();
                move |task_context| Self::run(listener, handler, sessions, runtime, task_context)
            })
            .await;

        Ok(Self { local_addr, worker })
    }

    /// The address the listener actually bound, which differs from the
    /// configured one when port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(&mut self) {
        self.worker.stop().await;
    }

    async fn run(
        listener: TcpListener,
        handler: Arc<AppHandler>,
        sessions: Arc<SessionManager>,
        runtime: Arc<Runtime>,
        mut task_context: TaskContext,
    ) {
        loop {
            select! {
              // CANCEL SAFETY: `TcpListener::accept` is cancel safe.
              accepted = listener.accept() => {
                match accepted {
                  Ok((stream, peer)) => {
                    tracing::debug!(%peer, "accepted viewer connection");
                    let handler = handler.clone();
                    let sessions = sessions.clone();
                    let _ = runtime
                      .task()
                      .spawn(move |task_context| {
                        Self::serve_viewer(stream, handler, sessions, task_context)
                      })
                      .await;
                  },
                  Err(err) => {
                    tracing::warn!(%err, "failed to accept viewer connection");
                  },
                }
              },
              // CANCEL SAFETY: `TaskContext::wait_for_stop` is cancel safe.
              _ = task_context.wait_for_stop() => {
                tracing::trace!("stopping server");
                break;
              },
            }
        }
    }

    /// One task per viewer connection: handshake, admission, then drain the
    /// inbound side until the client goes away. A client-initiated close is
    /// a terminal condition for the session like any other.
    async fn serve_viewer(
        stream: TcpStream,
        handler: Arc<AppHandler>,
        sessions: Arc<SessionManager>,
        mut task_context: TaskContext,
    ) {
        let mut path = String::new();
        let handshake =
            tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
                path = request.uri().path().to_string();
                Ok(response)
            })
            .await;
        let ws = match handshake {
            Ok(ws) => ws,
            Err(err) => {
                tracing::debug!(%err, "websocket handshake failed");
                return;
            }
        };

        let request = match AdmissionRequest::from_path(&path) {
            Some(request) => request,
            None => {
                tracing::debug!(%path, "viewer path not recognized");
                return;
            }
        };

        // Silent at the protocol level: the connection simply drops.
        if let Err(err) = handler.admit(&request).await {
            tracing::info!(%err, "viewer not admitted");
            return;
        }

        let (sink, mut inbound) = ws.split();
        let transport: Arc<dyn ViewerTransport> = Arc::new(WsTransport::new(sink));
        let id = sessions.spawn(request.device_id, transport).await;

        loop {
            select! {
              message = inbound.next() => {
                match message {
                  Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!(%id, "viewer closed the connection");
                    break;
                  },
                  Some(Ok(_)) => {
                    // Nothing inbound drives the relay.
                  },
                  Some(Err(err)) => {
                    tracing::debug!(%id, %err, "viewer connection error");
                    break;
                  },
                }
              },
              _ = task_context.wait_for_stop() => {
                break;
              },
            }
        }

        sessions.teardown(&id).await;
    }
}
