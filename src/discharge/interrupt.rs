//! Cooperative cancellation for a running test.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared flag for asking a running discharge test to stop.
///
/// The controller checks it at every cycle boundary and also wakes up from the
/// inter-cycle pause when it is raised. A round trip already in flight is never
/// cut short.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl InterruptFlag {
    /// Unraised flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the stop and wake a waiting controller.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether a stop was requested.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Lower the flag for another run.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Resolve once the flag is raised.
    pub async fn triggered(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a trigger in between is not lost.
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn clones_share_state() {
        let flag = InterruptFlag::new();
        let handle = flag.clone();

        handle.trigger();
        assert!(flag.is_triggered());

        flag.reset();
        assert!(!handle.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_wakes_on_trigger() {
        let flag = InterruptFlag::new();
        let handle = flag.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            handle.trigger();
        });

        tokio::time::timeout(Duration::from_secs(10), flag.triggered())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn already_triggered_resolves_immediately() {
        let flag = InterruptFlag::new();
        flag.trigger();

        flag.triggered().await;
    }
}
