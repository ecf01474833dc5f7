pub mod session_manager;
pub mod transport;
pub mod watchdog;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::select;
use tokio::sync::{mpsc, Mutex};

use crate::registry::{DeviceId, PortRegistry};
use crate::relay::throttle::Throttle;
use crate::relay::transmit::Transmitter;
use crate::runtime::task_manager::{Task, TaskContext};
use crate::session::transport::ViewerTransport;
use crate::session::watchdog::Watchdog;
use crate::source::mjpeg::StreamReader;
use crate::source::{port, Backoff};

pub enum SessionState {
    /// The streaming worker finished, for whatever reason.
    Stopped(SessionId),
    /// The idle watchdog fired before the session was torn down.
    Expired(SessionId),
}

pub type SessionStateTx = mpsc::UnboundedSender<SessionState>;
pub type SessionStateRx = mpsc::UnboundedReceiver<SessionState>;

/// Per-session knobs, derived from the application configuration.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Host serving the device-local streams, normally loopback.
    pub source_host: String,
    pub skip_frame: u32,
    pub skip_same_frame: u32,
    /// Hard session-duration ceiling enforced by the watchdog.
    pub idle_timeout: Duration,
    pub port_poll: Backoff,
    pub source_connect: Backoff,
}

/// One admitted viewer connection. Owned by the session manager; the
/// streaming worker, watchdog, and connection task only hold the pieces
/// they need.
pub struct Session {
    id: SessionId,
    device_id: DeviceId,
    started_at: Instant,
    transport: Arc<dyn ViewerTransport>,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    closed: bool,
    watchdog: Option<Watchdog>,
    worker: Option<Task>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        device_id: DeviceId,
        transport: Arc<dyn ViewerTransport>,
    ) -> Self {
        Self {
            id,
            device_id,
            started_at: Instant::now(),
            transport,
            inner: Mutex::new(SessionInner {
                closed: false,
                watchdog: None,
                worker: None,
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The watchdog and the worker are attached after the session is already
    /// registered, so either attach can lose a race against teardown. An
    /// attach on a closed session disposes of the handle instead of storing
    /// it, otherwise it would outlive `retire`.
    pub(crate) async fn attach_watchdog(&self, mut watchdog: Watchdog) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            watchdog.cancel();
            return;
        }
        inner.watchdog = Some(watchdog);
    }

    pub(crate) async fn attach_worker(&self, mut worker: Task) {
        {
            let mut inner = self.inner.lock().await;
            if !inner.closed {
                inner.worker = Some(worker);
                return;
            }
        }
        worker.stop().await;
    }

    /// First half of teardown: disarm the watchdog and stop the streaming
    /// worker. The per-session lock and the closed flag make this run at
    /// most once; the losing caller of a teardown race gets `false`.
    pub(crate) async fn retire(&self) -> bool {
        let worker = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return false;
            }
            inner.closed = true;
            if let Some(mut watchdog) = inner.watchdog.take() {
                watchdog.cancel();
            }
            inner.worker.take()
        };

        if let Some(mut worker) = worker {
            worker.stop().await;
        }

        tracing::debug!(
            id = %self.id,
            device_id = %self.device_id,
            elapsed = ?self.started_at.elapsed(),
            "session retired",
        );
        true
    }

    pub(crate) async fn close_transport(&self) {
        self.transport.close().await;
    }

    /// Streaming worker: resolve the device's streaming port, open the
    /// source stream, then pump frames through the throttle to the viewer
    /// until a terminal condition. Runs on its own task, independent of the
    /// admission path.
    pub(crate) async fn run(
        id: SessionId,
        device_id: DeviceId,
        ports: Arc<PortRegistry>,
        options: SessionOptions,
        transport: Arc<dyn ViewerTransport>,
        state_tx: SessionStateTx,
        mut task_context: TaskContext,
    ) {
        select! {
          _ = Self::relay(&id, &device_id, ports, &options, transport) => {},
          _ = task_context.wait_for_stop() => {
            tracing::trace!(%id, "streaming worker stopped");
          },
        };

        let _ = state_tx.send(SessionState::Stopped(id));
    }

    async fn relay(
        id: &SessionId,
        device_id: &DeviceId,
        ports: Arc<PortRegistry>,
        options: &SessionOptions,
        transport: Arc<dyn ViewerTransport>,
    ) {
        let port = match port::resolve(ports.as_ref(), device_id, options.port_poll).await {
            Ok(port) => port,
            Err(err) => {
                tracing::warn!(%id, %device_id, %err, "not streaming");
                return;
            }
        };
        tracing::info!(%id, %device_id, port, "streaming port resolved");

        let mut reader =
            match StreamReader::connect(&options.source_host, port, options.source_connect).await {
                Ok(reader) => reader,
                Err(err) => {
                    tracing::warn!(%id, %device_id, port, %err, "not streaming");
                    return;
                }
            };
        tracing::info!(%id, %device_id, port, "streaming");

        let mut throttle = Throttle::new(options.skip_frame, options.skip_same_frame);
        let transmitter = Transmitter::new(transport);
        while let Some(frame) = reader.next().await {
            if !throttle.admit(frame.len()) {
                continue;
            }
            if let Err(err) = transmitter.send(frame).await {
                tracing::debug!(%id, %err, "viewer connection failed mid-stream");
                return;
            }
        }

        tracing::info!(%id, %device_id, "stream ended");
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    const SESSION_ID_LEN: u32 = 8;

    pub fn generate() -> SessionId {
        SessionId(
            rand::thread_rng()
                .sample(rand::distributions::Uniform::from(
                    10_u32.pow(Self::SESSION_ID_LEN - 1)..10_u32.pow(Self::SESSION_ID_LEN),
                ))
                .to_string(),
        )
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for SessionId {
    fn from(session_id: &str) -> Self {
        SessionId(session_id.to_string())
    }
}
