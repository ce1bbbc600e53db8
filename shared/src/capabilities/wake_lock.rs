//! Screen wake lock seam.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

use super::sensors::PlatformError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WakeLockHandle(pub u64);

/// A held lock. `revoked` resolves if the platform takes the lock away
/// (tab hidden, battery saver); it errors if the provider forgets the lock
/// through a normal `release`.
#[derive(Debug)]
pub struct WakeLockGrant {
    pub handle: WakeLockHandle,
    pub revoked: oneshot::Receiver<()>,
}

#[async_trait]
pub trait WakeLockProvider: Send + Sync {
    async fn acquire(&self) -> Result<WakeLockGrant, PlatformError>;
    fn release(&self, handle: WakeLockHandle) -> Result<(), PlatformError>;
}

/// For platforms with no wake-lock API at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWakeLock;

#[async_trait]
impl WakeLockProvider for NoWakeLock {
    async fn acquire(&self) -> Result<WakeLockGrant, PlatformError> {
        Err(PlatformError::Unavailable("wake lock not supported".into()))
    }

    fn release(&self, _handle: WakeLockHandle) -> Result<(), PlatformError> {
        Ok(())
    }
}

/// Shell-driven wake lock: the shell reports availability and revocations.
#[derive(Debug)]
pub struct ShellWakeLock {
    held: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_handle: AtomicU64,
    available: AtomicBool,
    acquisitions: AtomicU64,
}

impl Default for ShellWakeLock {
    fn default() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            available: AtomicBool::new(true),
            acquisitions: AtomicU64::new(0),
        }
    }
}

impl ShellWakeLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<()>>> {
        self.held
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// The platform dropped every held lock.
    pub fn revoke_all(&self) -> usize {
        let revoked: Vec<_> = self.held().drain().collect();
        let count = revoked.len();
        for (_, tx) in revoked {
            let _ = tx.send(());
        }
        count
    }

    pub fn held_count(&self) -> usize {
        self.held().len()
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WakeLockProvider for ShellWakeLock {
    async fn acquire(&self) -> Result<WakeLockGrant, PlatformError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(PlatformError::Unavailable("wake lock refused".into()));
        }
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.held().insert(id, tx);
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(WakeLockGrant {
            handle: WakeLockHandle(id),
            revoked: rx,
        })
    }

    fn release(&self, handle: WakeLockHandle) -> Result<(), PlatformError> {
        self.held().remove(&handle.0);
        Ok(())
    }
}
