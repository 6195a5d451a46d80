use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Notify;

/// A flag that can be raised once and awaited by any number of tasks.
/// Used to cancel in-flight transaction operations.
#[derive(Clone, Default)]
pub struct OneTimeFlag {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    is_set: AtomicBool,
    notify: Notify,
}

impl OneTimeFlag {
    pub fn new() -> Self { Self::default() }

    /// Raise the flag. Returns true for the call that actually raised it.
    pub fn set(&self) -> bool {
        let first = !self.inner.is_set.swap(true, Ordering::SeqCst);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// Resolves once the flag is raised.
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // register before checking, otherwise a set() in between is missed
        notified.as_mut().enable();
        if self.is_set() {
            return;
        }
        notified.await;
    }

    pub fn is_set(&self) -> bool { self.inner.is_set.load(Ordering::SeqCst) }
}

impl std::fmt::Debug for OneTimeFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_tuple("OneTimeFlag").field(&self.is_set()).finish() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waiters_wake_on_set() {
        let flag = OneTimeFlag::new();
        let waiter = tokio::spawn({
            let flag = flag.clone();
            async move { flag.wait().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(flag.set());
        assert!(!flag.set());
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        // already set: returns immediately
        flag.wait().await;
    }
}
