//! Online/offline and foreground/background signals from the platform.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Tracks platform online/offline and foreground/background events.
#[derive(Clone, Debug)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

#[derive(Debug)]
struct MonitorInner {
    online: watch::Sender<bool>,
    visible: AtomicBool,
    drain_hint: Notify,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (online, _) = watch::channel(initially_online);
        Self {
            inner: Arc::new(MonitorInner {
                online,
                visible: AtomicBool::new(true),
                drain_hint: Notify::new(),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    pub fn is_visible(&self) -> bool {
        self.inner.visible.load(Ordering::SeqCst)
    }

    /// Feed from the platform's online/offline events. Returns true on an
    /// actual transition; repeated reports of the same state are ignored.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.inner.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!("connectivity restored");
            } else {
                warn!("connectivity lost");
            }
        }
        changed
    }

    /// Feed from page-visibility events. Coming to the foreground while
    /// online asks the sync driver for a drain.
    pub fn set_visible(&self, visible: bool) {
        let was_visible = self.inner.visible.swap(visible, Ordering::SeqCst);
        if visible && !was_visible && self.is_online() {
            debug!("foregrounded while online, requesting drain");
            self.inner.drain_hint.notify_one();
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    /// Resolves on the next drain hint. A hint raised while nobody waits is
    /// kept for the next waiter.
    pub async fn drain_requested(&self) {
        self.inner.drain_hint.notified().await;
    }

    /// Runs `callback` on every transition until the returned handle is
    /// aborted or the monitor is dropped. A panicking callback is logged and
    /// the subscription keeps running.
    pub fn on_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(bool) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if catch_unwind(AssertUnwindSafe(|| callback(online))).is_err() {
                    error!(online, "connectivity callback panicked");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn transitions_are_deduplicated() {
        let monitor = ConnectivityMonitor::new(false);
        assert!(!monitor.is_online());
        assert!(monitor.set_online(true));
        assert!(!monitor.set_online(true));
        assert!(monitor.is_online());
        assert!(monitor.set_online(false));
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.subscribe();
        monitor.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }

    #[tokio::test]
    async fn callbacks_survive_panics() {
        let monitor = ConnectivityMonitor::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = monitor.on_change(move |online| {
            sink.lock().unwrap().push(online);
            if !online {
                panic!("handler bug");
            }
        });

        monitor.set_online(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.set_online(true);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn foregrounding_while_online_hints_drain() {
        let monitor = ConnectivityMonitor::new(true);
        monitor.set_visible(false);
        monitor.set_visible(true);
        tokio::time::timeout(Duration::from_millis(50), monitor.drain_requested())
            .await
            .expect("hint should be pending");
    }

    #[tokio::test]
    async fn foregrounding_offline_does_not_hint() {
        let monitor = ConnectivityMonitor::new(false);
        monitor.set_visible(false);
        monitor.set_visible(true);
        let hinted =
            tokio::time::timeout(Duration::from_millis(20), monitor.drain_requested()).await;
        assert!(hinted.is_err());
    }
}
