use std::sync::Arc;
use std::time::Duration;

use haven_core::capabilities::{
    DurableStore, MemoryKv, MemoryRemote, QueuedNotifier, ShellSensor, ShellWakeLock,
};
use haven_core::{Capabilities, ChildCode, HavenConfig, HavenCore, LocationSample, MotionSample};

/// Shell-side handles for driving a core in tests.
#[allow(dead_code)]
pub struct Fixture {
    pub kv: Arc<dyn DurableStore>,
    pub remote: Arc<MemoryRemote>,
    pub notifier: Arc<QueuedNotifier>,
    pub location: Arc<ShellSensor<LocationSample>>,
    pub motion: Arc<ShellSensor<MotionSample>>,
    pub wake: Arc<ShellWakeLock>,
}

#[allow(dead_code)]
impl Fixture {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryKv::new()))
    }

    pub fn with_store(kv: Arc<dyn DurableStore>) -> Self {
        Self {
            kv,
            remote: Arc::new(MemoryRemote::new()),
            notifier: Arc::new(QueuedNotifier::default()),
            location: Arc::new(ShellSensor::new()),
            motion: Arc::new(ShellSensor::new()),
            wake: Arc::new(ShellWakeLock::new()),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            kv: self.kv.clone(),
            remote: self.remote.clone(),
            notifier: self.notifier.clone(),
            location: self.location.clone(),
            motion: self.motion.clone(),
            wake_lock: self.wake.clone(),
            crypto: None,
        }
    }

    pub fn core(&self, online: bool) -> HavenCore {
        HavenCore::new(HavenConfig::default(), self.capabilities(), online)
            .expect("default config is valid")
    }
}

#[allow(dead_code)]
pub fn child() -> ChildCode {
    ChildCode::new("KID7").expect("valid child code")
}

/// Polls `check` until it holds or `limit` of (possibly paused) time passes.
#[allow(dead_code)]
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
