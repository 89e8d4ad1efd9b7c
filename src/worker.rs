//! Supervision handles for long-running background workers.
//!
//! Every background loop (mesh sweep, dead-letter listener, health watcher)
//! is spawned through a `watch`-channel cancellation pair and hands back a
//! [`WorkerHandle`]. The composition root owns the handles and stops the
//! workers on shutdown; nothing runs as a global singleton.

use tokio::sync::watch;

/// Handle to a running background worker.
pub struct WorkerHandle {
    cancel: watch::Sender<bool>,
}

impl WorkerHandle {
    /// Signal the worker to stop.
    ///
    /// The worker finishes its current select arm and exits; an in-flight
    /// network call is abandoned rather than awaited.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Create a cancellation pair for a new worker.
///
/// The receiver side is moved into the worker's `tokio::select!` loop; the
/// sender side is wrapped in the returned handle.
pub fn cancellation() -> (WorkerHandle, watch::Receiver<bool>) {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    (WorkerHandle { cancel: cancel_tx }, cancel_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_reaches_worker() {
        let (handle, mut cancel_rx) = cancellation();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {}
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        handle.stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("worker did not stop")
            .expect("worker panicked");
    }

    #[tokio::test]
    async fn test_dropping_handle_does_not_panic_worker() {
        let (handle, mut cancel_rx) = cancellation();
        drop(handle);

        // Receiver observes the sender closing and can exit cleanly.
        let closed = cancel_rx.changed().await;
        assert!(closed.is_err());
    }
}
