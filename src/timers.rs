//! Named, cancelable one-shot timers that deliver a message into their
//! owner's channel.
//!
//! Two flavors exist. Normal timers always fire after their delay. Lazy
//! timers remember a wall-clock deadline; when the process was suspended
//! past it, the message is discarded, so a machine coming back from sleep
//! does not fire a backlog of retransmissions at the network.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Slack added to a lazy deadline before a late firing counts as a
/// suspension.
pub(crate) const LAZY_TOLERANCE: Duration = Duration::from_secs(5);

pub(crate) struct TimerSet<M> {
    tx: mpsc::UnboundedSender<M>,
    timers: HashMap<String, JoinHandle<()>>,
}

impl<M: Send + 'static> TimerSet<M> {
    pub fn new(tx: mpsc::UnboundedSender<M>) -> Self {
        Self {
            tx,
            timers: HashMap::new(),
        }
    }

    /// Fire `msg` after `delay`, even when the system slept through it.
    pub fn schedule(&mut self, id: impl Into<String>, delay: Duration, msg: M) {
        self.schedule_inner(id.into(), delay, msg, false);
    }

    /// Fire `msg` after `delay`, unless the system was suspended past the
    /// deadline.
    pub fn schedule_lazy(&mut self, id: impl Into<String>, delay: Duration, msg: M) {
        self.schedule_inner(id.into(), delay, msg, true);
    }

    fn schedule_inner(&mut self, id: String, delay: Duration, msg: M, lazy: bool) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
        }
        self.timers.retain(|_, handle| !handle.is_finished());

        let tx = self.tx.clone();
        let deadline = SystemTime::now() + delay + LAZY_TOLERANCE;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if lazy && SystemTime::now() > deadline {
                tracing::debug!("dropping timer that slept through its deadline");
                return;
            }
            let _ = tx.send(msg);
        });
        self.timers.insert(id, handle);
    }

    pub fn is_scheduled(&self, id: &str) -> bool {
        self.timers
            .get(id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn cancel(&mut self, id: &str) {
        if let Some(handle) = self.timers.remove(id) {
            handle.abort();
        }
    }

    pub fn clear(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

impl<M> Drop for TimerSet<M> {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TimerSet;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn should_fire_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);
        timers.schedule("tick", Duration::from_secs(2), 7u32);

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn should_cancel_by_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);
        timers.schedule("tick", Duration::from_secs(1), 1u32);
        timers.cancel("tick");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn should_replace_same_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);
        timers.schedule("tick", Duration::from_secs(1), 1u32);
        timers.schedule("tick", Duration::from_secs(5), 2u32);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn should_clear_everything() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);
        timers.schedule("one", Duration::from_secs(1), 1u32);
        timers.schedule_lazy("two", Duration::from_secs(1), 2u32);
        timers.clear();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn should_fire_lazy_timers_when_not_suspended() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);
        timers.schedule_lazy("tick", Duration::from_secs(1), 9u32);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().unwrap(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn should_report_scheduled_state() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);
        assert!(!timers.is_scheduled("tick"));
        timers.schedule("tick", Duration::from_secs(1), 0u32);
        assert!(timers.is_scheduled("tick"));
    }
}
