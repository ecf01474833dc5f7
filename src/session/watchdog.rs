use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::oneshot;
use tokio::time;

use crate::session::transport::ViewerTransport;
use crate::session::{SessionId, SessionState, SessionStateTx};

/// One-shot session-duration ceiling. Armed once at session start; if it is
/// not canceled before the timeout elapses it notifies the viewer (when the
/// connection is still open) and reports expiry so the manager tears the
/// session down. Frame activity does not re-arm it.
pub struct Watchdog {
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl Watchdog {
    pub fn arm(
        id: SessionId,
        transport: Arc<dyn ViewerTransport>,
        timeout: Duration,
        state_tx: SessionStateTx,
    ) -> Self {
        let (cancel_tx, cancel_rx) = oneshot::channel();

        tokio::spawn(async move {
            select! {
              _ = time::sleep(timeout) => {
                tracing::info!(%id, "session duration ceiling reached");
                if transport.is_open().await {
                  let notice = serde_json::json!({ "msg": "error" });
                  let _ = transport.send_text(notice.to_string()).await;
                }
                let _ = state_tx.send(SessionState::Expired(id));
              },
              _ = cancel_rx => {},
            }
        });

        Self {
            cancel_tx: Some(cancel_tx),
        }
    }

    /// Disarms the timer. Only the first call does anything; teardown paths
    /// may race and the loser must be a no-op.
    pub fn cancel(&mut self) -> bool {
        match self.cancel_tx.take() {
            Some(cancel_tx) => {
                let _ = cancel_tx.send(());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time;

    use crate::session::transport::testing::RecordingTransport;
    use crate::session::transport::ViewerTransport;
    use crate::session::{SessionId, SessionState};

    use super::Watchdog;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn fire_notifies_open_viewer_once() {
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(RecordingTransport::new());
        let id = SessionId::generate();

        let _watchdog = Watchdog::arm(id.clone(), transport.clone(), SHORT, state_tx);

        let state = state_rx.recv().await;
        assert!(matches!(state, Some(SessionState::Expired(fired)) if fired == id));
        assert_eq!(transport.texts().await, vec![r#"{"msg":"error"}"#.to_string()]);
    }

    #[tokio::test]
    async fn fire_on_closed_connection_sends_nothing() {
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(RecordingTransport::new());
        transport.close().await;

        let _watchdog = Watchdog::arm(SessionId::generate(), transport.clone(), SHORT, state_tx);

        assert!(matches!(
            state_rx.recv().await,
            Some(SessionState::Expired(_))
        ));
        assert!(transport.texts().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_disarms_and_is_idempotent() {
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(RecordingTransport::new());

        let mut watchdog = Watchdog::arm(SessionId::generate(), transport.clone(), SHORT, state_tx);
        assert!(watchdog.cancel());
        assert!(!watchdog.cancel());

        time::sleep(SHORT * 3).await;
        assert!(state_rx.try_recv().is_err());
        assert!(transport.texts().await.is_empty());
    }
}
