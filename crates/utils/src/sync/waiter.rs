//! Re-armable one-shot gate

use std::future::Future;
use tokio::sync::watch;

/// A one-shot event that can be awaited any number of times.
///
/// `wait()` registered after `fire()` resolves on its first poll, so there is
/// no window in which a signal can be missed. `reset()` rearms the gate, for
/// example after the server connection drops. Waiting never fails.
#[derive(Debug)]
pub struct Waiter {
    fired: watch::Sender<bool>,
}

impl Waiter {
    pub fn new() -> Self {
        let (fired, _) = watch::channel(false);
        Self { fired }
    }

    /// Mark the event as fired and release every waiter.
    pub fn fire(&self) {
        self.fired.send_replace(true);
    }

    /// Rearm the gate. Waiters that have not yet observed the fired state keep
    /// waiting for the next `fire()`.
    pub fn reset(&self) {
        self.fired.send_replace(false);
    }

    pub fn is_fired(&self) -> bool {
        *self.fired.borrow()
    }

    /// Future resolving once the event has fired.
    ///
    /// The subscription is taken when `wait()` is called, not when the future
    /// is first polled, and the future does not borrow `self`.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.fired.subscribe();
        async move {
            // Err means the waiter itself was dropped; nothing left to wait for
            let _ = receiver.wait_for(|fired| *fired).await;
        }
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_wait_after_fire_resolves_immediately() {
        let waiter = Waiter::new();
        waiter.fire();
        assert!(waiter.wait().now_or_never().is_some());
    }

    #[test]
    fn test_wait_before_fire_is_pending() {
        let waiter = Waiter::new();
        assert!(waiter.wait().now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_fire_releases_pending_waiters() {
        let waiter = Arc::new(Waiter::new());
        let first = tokio::spawn(waiter.wait());
        let second = tokio::spawn(waiter.wait());

        tokio::task::yield_now().await;
        waiter.fire();

        tokio::time::timeout(Duration::from_secs(1), async {
            first.await.unwrap();
            second.await.unwrap();
        })
        .await
        .expect("waiters should be released");
    }

    #[test]
    fn test_reset_rearms() {
        let waiter = Waiter::new();
        waiter.fire();
        assert!(waiter.is_fired());

        waiter.reset();
        assert!(!waiter.is_fired());
        assert!(waiter.wait().now_or_never().is_none());

        waiter.fire();
        assert!(waiter.wait().now_or_never().is_some());
    }

    #[test]
    fn test_dropped_waiter_releases_future() {
        let waiter = Waiter::new();
        let pending = waiter.wait();
        drop(waiter);
        assert!(pending.now_or_never().is_some());
    }
}
