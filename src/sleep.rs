//! Detects that the machine slept by watching the wall clock jump past a
//! monotonic tick, and broadcasts a wake signal every actor can subscribe
//! to. Probes restart, queries refresh, responders re-verify their names.

use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);
const TOLERANCE: Duration = Duration::from_secs(5);

pub(crate) struct SleepMonitor {
    tx: broadcast::Sender<()>,
    watcher: JoinHandle<()>,
}

impl SleepMonitor {
    pub fn spawn() -> Self {
        let (tx, _) = broadcast::channel(4);
        let notifier = tx.clone();
        let watcher = tokio::spawn(async move {
            loop {
                let before = SystemTime::now();
                tokio::time::sleep(CHECK_INTERVAL).await;
                match before.elapsed() {
                    Ok(elapsed) if elapsed > CHECK_INTERVAL + TOLERANCE => {
                        tracing::debug!(
                            "wall clock jumped {}s, signaling wake from sleep",
                            elapsed.as_secs()
                        );
                        let _ = notifier.send(());
                    }
                    // clock moved backwards; treat as a jump too
                    Err(_) => {
                        let _ = notifier.send(());
                    }
                    Ok(_) => {}
                }
            }
        });
        Self { tx, watcher }
    }

    /// Handle actors use to subscribe for wake notifications.
    pub fn sender(&self) -> broadcast::Sender<()> {
        self.tx.clone()
    }
}

impl Drop for SleepMonitor {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
