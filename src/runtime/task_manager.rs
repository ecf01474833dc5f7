use std::future::Future;

use tokio::select;
use tokio::spawn;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

pub struct TaskManager {
    hold_tx: Mutex<Option<mpsc::Sender<()>>>,
    hold_rx: Mutex<mpsc::Receiver<()>>,
    stop_tx: broadcast::Sender<()>,
}

impl TaskManager {
    pub fn new() -> Self {
        let (hold_tx, hold_rx) = mpsc::channel(1);
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            // Must protect by mutex since another task might
            // invalidate the `hold_tx` once shutdown begins.
            hold_tx: Mutex::new(Some(hold_tx)),
            // Must protect `hold_rx` by mutex to allow for
            // internal mutability.
            hold_rx: Mutex::new(hold_rx),
            stop_tx,
        }
    }

    pub async fn spawn<F, T>(&self, f: F) -> Task
    where
        F: FnOnce(TaskContext) -> T + Send + 'static,
        T: Future + Send + 'static,
        T::Output: Send + 'static,
    {
        let (task_stop_tx, task_stop_rx) = broadcast::channel(1);
        let (task_hold_tx, task_hold_rx) = mpsc::channel(1);

        // Unlock the `hold_tx` mutex and grab a copy to pass on to the task
        // context. `hold_tx` could be empty if another task already asked the
        // manager to stop, in which case we ignore the request and don't
        // start a task at all. The returned handle then stops immediately.
        if let Some(hold_tx) = self
            .hold_tx
            .lock()
            .await
            .as_ref()
            .map(|hold_tx| hold_tx.clone())
        {
            let stop_rx = self.stop_tx.subscribe();
            let _ = spawn(async move {
                // Instantiate the task context here. After the future
                // generated by `f` has finished, it will be dropped, which
                // releases the hold tokens as well.
                let task_context = TaskContext {
                    stop_all: stop_rx,
                    stop_task: task_stop_rx,
                    _token: hold_tx,
                    _task_token: task_hold_tx,
                };

                f(task_context).await;
            });
        }

        Task {
            stop_tx: task_stop_tx,
            hold_rx: task_hold_rx,
        }
    }

    pub async fn stop(&self) {
        // If we don't drop the apex hold_tx here then the call to recv()
        // below will block forever since there would be one remaining hold.
        drop(self.hold_tx.lock().await.take());

        // Send stop signal to all tasks using the stop signal broadcast
        // channel; tasks must respond! Note: it is important that this
        // happens after the remaining `hold_tx` is dropped, since dropping
        // `hold_tx` also causes further invocations of `spawn` to be
        // ignored. If they were not ignored, then a new task could be
        // spawned that never received the stop request, causing a deadlock.
        let _ = self.stop_tx.send(());

        // Wait for the channel to break after all `hold_tx` are dropped,
        // which means all tasks have finished.
        let _ = self.hold_rx.lock().await.recv().await;
    }
}

/// Handle to a single spawned task. Stopping it signals only that task and
/// waits until its future has been dropped.
pub struct Task {
    stop_tx: broadcast::Sender<()>,
    hold_rx: mpsc::Receiver<()>,
}

impl Task {
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        // Broken channel means the task already finished on its own.
        let _ = self.hold_rx.recv().await;
    }
}

pub struct TaskContext {
    stop_all: broadcast::Receiver<()>,
    stop_task: broadcast::Receiver<()>,
    _token: mpsc::Sender<()>,
    _task_token: mpsc::Sender<()>,
}

impl TaskContext {
    pub async fn wait_for_stop(&mut self) {
        select! {
          _ = self.stop_all.recv() => {},
          _ = self.stop_task.recv() => {},
        };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::TaskManager;

    #[tokio::test]
    async fn stop_waits_for_tasks() {
        let manager = TaskManager::new();
        let finished = Arc::new(AtomicBool::new(false));

        let _task = manager
            .spawn({
                let finished = finished.clone();
                move |mut task_context| async move {
                    task_context.wait_for_stop().await;
                    finished.store(true, Ordering::SeqCst);
                }
            })
            .await;

        manager.stop().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn task_handle_stops_single_task() {
        let manager = TaskManager::new();
        let finished = Arc::new(AtomicBool::new(false));

        let mut task = manager
            .spawn({
                let finished = finished.clone();
                move |mut task_context| async move {
                    task_context.wait_for_stop().await;
                    finished.store(true, Ordering::SeqCst);
                }
            })
            .await;

        task.stop().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_of_finished_task_is_noop() {
        let manager = TaskManager::new();
        let mut task = manager.spawn(|_task_context| async move {}).await;
        task.stop().await;
        task.stop().await;
    }
}
