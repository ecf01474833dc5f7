use std::collections::HashMap;
use std::sync::Arc;

use tokio::select;
use tokio::sync::{mpsc, RwLock};

use crate::registry::{DeviceId, PortRegistry};
use crate::runtime::task_manager::{Task, TaskContext};
use crate::runtime::Runtime;
use crate::session::transport::ViewerTransport;
use crate::session::watchdog::Watchdog;
use crate::session::{
    Session, SessionId, SessionOptions, SessionState, SessionStateRx, SessionStateTx,
};

type SessionMap = Arc<RwLock<HashMap<SessionId, Arc<Session>>>>;
type DeviceMap = Arc<RwLock<HashMap<DeviceId, SessionId>>>;

/// Owns all open sessions. A session is in the map if and only if its
/// admission succeeded and it has not been torn down yet.
pub struct SessionManager {
    sessions: SessionMap,
    by_device: DeviceMap,
    state_tx: SessionStateTx,
    port_registry: Arc<PortRegistry>,
    options: SessionOptions,
    runtime: Arc<Runtime>,
    // Keeps the state worker's handle alive; the worker itself is stopped
    // through the runtime on shutdown.
    _worker: Task,
}

impl SessionManager {
    pub async fn start(
        runtime: Arc<Runtime>,
        port_registry: Arc<PortRegistry>,
        options: SessionOptions,
    ) -> Self {
        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
        let by_device: DeviceMap = Arc::new(RwLock::new(HashMap::new()));
        let (state_tx, state_rx) = mpsc::unbounded_channel();

        tracing::trace!("starting session manager");
        let worker = runtime
            .task()
            .spawn({
                let sessions = sessions.clone();
                let by_device = by_device.clone();
                move |task_context| Self::run(sessions, by_device, state_rx, task_context)
            })
            .await;
        tracing::trace!("started session manager");

        Self {
            sessions,
            by_device,
            state_tx,
            port_registry,
            options,
            runtime,
            _worker: worker,
        }
    }

    /// Registers a session for an admitted viewer, arms its watchdog, and
    /// spawns the streaming worker. Returns as soon as the worker is
    /// spawned; the admission path never blocks on port resolution.
    pub async fn spawn(
        &self,
        device_id: DeviceId,
        transport: Arc<dyn ViewerTransport>,
    ) -> SessionId {
        let id = SessionId::generate();
        let session = Arc::new(Session::new(id.clone(), device_id.clone(), transport.clone()));

        self.sessions.write().await.insert(id.clone(), session.clone());
        self.by_device
            .write()
            .await
            .insert(device_id.clone(), id.clone());
        tracing::info!(%id, %device_id, "registered session");

        // Armed only after registration: an expiry event must find the
        // session in the map, or close would be a no-op and leave the
        // session without its duration ceiling.
        let watchdog = Watchdog::arm(
            id.clone(),
            transport.clone(),
            self.options.idle_timeout,
            self.state_tx.clone(),
        );
        session.attach_watchdog(watchdog).await;

        let worker = self
            .runtime
            .task()
            .spawn({
                let id = id.clone();
                let ports = self.port_registry.clone();
                let options = self.options.clone();
                let state_tx = self.state_tx.clone();
                move |task_context| {
                    Session::run(id, device_id, ports, options, transport, state_tx, task_context)
                }
            })
            .await;
        session.attach_worker(worker).await;

        id
    }

    /// Tears a session down. Every terminal condition funnels here; calling
    /// it for an unknown or already-closed session is a no-op.
    pub async fn teardown(&self, id: &SessionId) -> bool {
        Self::close(&self.sessions, &self.by_device, id).await
    }

    /// Tears down everything still open. Used on shutdown.
    pub async fn stop(&self) {
        let ids: Vec<SessionId> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            Self::close(&self.sessions, &self.by_device, &id).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn close(sessions: &SessionMap, by_device: &DeviceMap, id: &SessionId) -> bool {
        // The map removal is atomic, so concurrent teardown triggers (say a
        // watchdog fire racing a stream error) elect exactly one winner.
        let session = sessions.write().await.remove(id);
        let session = match session {
            Some(session) => session,
            None => {
                tracing::trace!(%id, "teardown of unknown or already-closed session");
                return false;
            }
        };

        session.retire().await;

        {
            let mut by_device = by_device.write().await;
            if by_device.get(session.device_id()) == Some(id) {
                by_device.remove(session.device_id());
            }
        }

        session.close_transport().await;
        tracing::info!(%id, device_id = %session.device_id(), "session closed");
        true
    }

    async fn run(
        sessions: SessionMap,
        by_device: DeviceMap,
        mut state_rx: SessionStateRx,
        mut task_context: TaskContext,
    ) {
        loop {
            select! {
              // CANCEL SAFETY: `mpsc::UnboundedReceiver::recv` is cancel safe.
              state = state_rx.recv() => {
                match state {
                  Some(SessionState::Stopped(id)) => {
                    tracing::trace!(%id, "session worker stopped");
                    Self::close(&sessions, &by_device, &id).await;
                  },
                  Some(SessionState::Expired(id)) => {
                    tracing::trace!(%id, "session expired");
                    Self::close(&sessions, &by_device, &id).await;
                  },
                  None => {
                    tracing::error!("session state channel broke unexpectedly");
                    break;
                  },
                }
              },
              // CANCEL SAFETY: `TaskContext::wait_for_stop` is cancel safe.
              _ = task_context.wait_for_stop() => {
                tracing::trace!("stopping session manager");
                break;
              },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time;

    use crate::registry::{DeviceId, PortRegistry};
    use crate::runtime::Runtime;
    use crate::session::transport::testing::RecordingTransport;
    use crate::session::SessionOptions;
    use crate::source::Backoff;

    use super::SessionManager;

    fn fast_options() -> SessionOptions {
        SessionOptions {
            source_host: "127.0.0.1".to_string(),
            skip_frame: 5,
            skip_same_frame: 10,
            idle_timeout: Duration::from_secs(30),
            port_poll: Backoff {
                attempts: 5,
                delay: Duration::from_millis(1),
            },
            source_connect: Backoff {
                attempts: 20,
                delay: Duration::from_millis(5),
            },
        }
    }

    async fn start_manager(options: SessionOptions) -> (SessionManager, Arc<PortRegistry>) {
        let runtime = Arc::new(Runtime::new());
        let ports = Arc::new(PortRegistry::new());
        let manager = SessionManager::start(runtime, ports.clone(), options).await;
        (manager, ports)
    }

    async fn wait_until_drained(manager: &SessionManager) {
        for _ in 0..1000 {
            if manager.is_empty().await {
                return;
            }
            time::sleep(Duration::from_millis(2)).await;
        }
        panic!("sessions never drained");
    }

    fn frame_payload(ordinal: usize) -> Vec<u8> {
        let mut payload = vec![0xFF, 0xD8];
        payload.extend(std::iter::repeat(ordinal as u8).take(ordinal));
        payload.extend_from_slice(&[0xFF, 0xD9]);
        payload
    }

    /// Serves one HTTP connection with `count` distinct-length MJPEG parts,
    /// then closes.
    async fn serve_frames(count: usize) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request).await;

            let mut body = b"HTTP/1.1 200 OK\r\n\
                Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
                \r\n"
                .to_vec();
            for ordinal in 1..=count {
                let payload = frame_payload(ordinal);
                body.extend_from_slice(
                    format!(
                        "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                        payload.len()
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(&payload);
                body.extend_from_slice(b"\r\n");
            }
            stream.write_all(&body).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        port
    }

    #[tokio::test]
    async fn relays_decimated_frames_in_order() {
        let (manager, ports) = start_manager(fast_options()).await;
        let device = DeviceId::from("emulator-5554");
        let transport = Arc::new(RecordingTransport::new());

        let port = serve_frames(20).await;
        ports.publish(device.clone(), port).await;

        manager.spawn(device, transport.clone()).await;
        wait_until_drained(&manager).await;

        let frames = transport.frames().await;
        let expected: Vec<Vec<u8>> = vec![
            frame_payload(5),
            frame_payload(10),
            frame_payload(15),
            frame_payload(20),
        ];
        assert_eq!(frames.len(), 4);
        for (frame, expected) in frames.iter().zip(expected.iter()) {
            assert_eq!(&frame[..], &expected[..]);
        }
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn port_resolution_timeout_reaches_teardown() {
        let mut options = fast_options();
        options.idle_timeout = Duration::from_millis(100);
        let (manager, _ports) = start_manager(options).await;
        let transport = Arc::new(RecordingTransport::new());

        manager
            .spawn(DeviceId::from("emulator-5554"), transport.clone())
            .await;
        wait_until_drained(&manager).await;

        assert!(transport.frames().await.is_empty());
        assert_eq!(transport.close_calls(), 1);

        // The watchdog was canceled during teardown: letting its deadline
        // pass must not produce the timeout notification.
        time::sleep(Duration::from_millis(150)).await;
        assert!(transport.texts().await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_source_reaches_teardown() {
        let mut options = fast_options();
        options.source_connect = Backoff {
            attempts: 2,
            delay: Duration::from_millis(1),
        };
        let (manager, ports) = start_manager(options).await;
        let device = DeviceId::from("emulator-5554");
        let transport = Arc::new(RecordingTransport::new());

        // Grab a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        ports.publish(device.clone(), port).await;

        manager.spawn(device, transport.clone()).await;
        wait_until_drained(&manager).await;

        assert!(transport.frames().await.is_empty());
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn watchdog_expiry_notifies_and_tears_down() {
        let mut options = fast_options();
        options.idle_timeout = Duration::from_millis(20);
        options.port_poll = Backoff {
            attempts: 10_000,
            delay: Duration::from_millis(1),
        };
        let (manager, _ports) = start_manager(options).await;
        let transport = Arc::new(RecordingTransport::new());

        manager
            .spawn(DeviceId::from("emulator-5554"), transport.clone())
            .await;
        wait_until_drained(&manager).await;

        assert_eq!(
            transport.texts().await,
            vec![r#"{"msg":"error"}"#.to_string()]
        );
        assert!(transport.frames().await.is_empty());
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn immediate_expiry_still_tears_down() {
        // A watchdog deadline that elapses while the session is still being
        // registered must converge on teardown rather than orphan the
        // session.
        let mut options = fast_options();
        options.idle_timeout = Duration::ZERO;
        options.port_poll = Backoff {
            attempts: 10_000,
            delay: Duration::from_millis(1),
        };
        let (manager, _ports) = start_manager(options).await;
        let transport = Arc::new(RecordingTransport::new());

        manager
            .spawn(DeviceId::from("emulator-5554"), transport.clone())
            .await;
        wait_until_drained(&manager).await;

        assert_eq!(
            transport.texts().await,
            vec![r#"{"msg":"error"}"#.to_string()]
        );
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_teardown_closes_exactly_once() {
        let mut options = fast_options();
        options.port_poll = Backoff {
            attempts: 10_000,
            delay: Duration::from_millis(2),
        };
        let (manager, _ports) = start_manager(options).await;
        let transport = Arc::new(RecordingTransport::new());

        let id = manager
            .spawn(DeviceId::from("emulator-5554"), transport.clone())
            .await;

        let (first, second) = tokio::join!(manager.teardown(&id), manager.teardown(&id));
        assert!(first != second, "exactly one teardown must win");
        assert_eq!(transport.close_calls(), 1);
        assert!(manager.is_empty().await);

        // A third invocation long after the fact stays a no-op.
        assert!(!manager.teardown(&id).await);
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn stop_drains_open_sessions() {
        let mut options = fast_options();
        options.port_poll = Backoff {
            attempts: 10_000,
            delay: Duration::from_millis(2),
        };
        let (manager, _ports) = start_manager(options).await;
        let transport = Arc::new(RecordingTransport::new());

        manager
            .spawn(DeviceId::from("emulator-5554"), transport.clone())
            .await;
        manager.stop().await;

        assert!(manager.is_empty().await);
        assert_eq!(transport.close_calls(), 1);
    }
}
