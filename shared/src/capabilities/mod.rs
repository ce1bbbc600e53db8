mod kv;
mod notify;
mod remote;
mod sensors;
mod wake_lock;

use std::sync::Arc;

#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKv;
pub use self::kv::{DurableStore, KeyNamespace, KvError, KvKey, MemoryKv, MAX_VALUE_SIZE};
pub use self::notify::{
    Notice, NoticeCode, Notifier, QueuedNotifier, Severity, ShellSignal, SoundKind,
    TracingNotifier,
};
pub use self::remote::{
    ErrorCategory, JournalEntry, MemoryRemote, RemoteError, RemotePath, RemoteStore, WriteOp,
};
pub use self::sensors::{
    PlatformError, SensorProvider, ShellSensor, WatchEvent, WatchHandle, WatchSink,
};
pub use self::wake_lock::{
    NoWakeLock, ShellWakeLock, WakeLockGrant, WakeLockHandle, WakeLockProvider,
};

use crate::crypto::CryptoProvider;
use crate::model::{LocationSample, MotionSample};

pub type LocationProvider = dyn SensorProvider<LocationSample>;
pub type MotionProvider = dyn SensorProvider<MotionSample>;

/// Everything the core needs from the host, injected once at the
/// composition root.
#[derive(Clone)]
pub struct Capabilities {
    pub kv: Arc<dyn DurableStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub notifier: Arc<dyn Notifier>,
    pub location: Arc<LocationProvider>,
    pub motion: Arc<MotionProvider>,
    pub wake_lock: Arc<dyn WakeLockProvider>,
    /// Seals durable blobs at rest when present.
    pub crypto: Option<Arc<dyn CryptoProvider>>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("sealed", &self.crypto.is_some())
            .finish_non_exhaustive()
    }
}
