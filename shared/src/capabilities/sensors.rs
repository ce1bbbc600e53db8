//! Location and motion watch seams.
//!
//! A watch delivers into a [`WatchSink`]. Every sink carries the generation
//! it was registered under, so a consumer can drop events that outlive the
//! session that asked for them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("capability unavailable: {0}")]
    Unavailable(String),

    #[error("platform failure: {0}")]
    Failed(String),
}

impl PlatformError {
    /// Retrying will not help; degrade instead.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlatformError::PermissionDenied(_) | PlatformError::Unavailable(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Sample(T),
    Error(PlatformError),
}

#[derive(Debug)]
pub struct WatchSink<T> {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, WatchEvent<T>)>,
}

impl<T> Clone for WatchSink<T> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            tx: self.tx.clone(),
        }
    }
}

impl<T> WatchSink<T> {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, WatchEvent<T>)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the consumer is gone.
    pub fn sample(&self, value: T) -> bool {
        self.tx
            .send((self.generation, WatchEvent::Sample(value)))
            .is_ok()
    }

    pub fn error(&self, error: PlatformError) -> bool {
        self.tx
            .send((self.generation, WatchEvent::Error(error)))
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
pub trait SensorProvider<T: Send + 'static>: Send + Sync {
    /// Registration may prompt for permission, hence async.
    async fn watch(&self, sink: WatchSink<T>) -> Result<WatchHandle, PlatformError>;

    /// Must be synchronous; after it returns the provider stops delivering
    /// into the sink registered under `handle`.
    fn unwatch(&self, handle: WatchHandle) -> Result<(), PlatformError>;
}

/// Bridge for shells that receive sensor callbacks on their side (browser
/// geolocation, device motion events) and forward them into the core.
#[derive(Debug)]
pub struct ShellSensor<T> {
    sinks: Mutex<HashMap<u64, WatchSink<T>>>,
    last_issued: Mutex<Option<WatchSink<T>>>,
    next_handle: AtomicU64,
    denied: AtomicBool,
    available: AtomicBool,
}

impl<T> Default for ShellSensor<T> {
    fn default() -> Self {
        Self {
            sinks: Mutex::new(HashMap::new()),
            last_issued: Mutex::new(None),
            next_handle: AtomicU64::new(1),
            denied: AtomicBool::new(false),
            available: AtomicBool::new(true),
        }
    }
}

impl<T: Clone> ShellSensor<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn sinks(&self) -> MutexGuard<'_, HashMap<u64, WatchSink<T>>> {
        self.sinks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Future `watch` calls fail with `PermissionDenied` while set.
    pub fn set_permission_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Forwards a platform reading to every active watch. Returns how many
    /// sinks accepted it.
    pub fn emit(&self, value: T) -> usize {
        self.sinks()
            .values()
            .filter(|sink| sink.sample(value.clone()))
            .count()
    }

    pub fn emit_error(&self, error: PlatformError) -> usize {
        self.sinks()
            .values()
            .filter(|sink| sink.error(error.clone()))
            .count()
    }

    pub fn active_watches(&self) -> usize {
        self.sinks().len()
    }

    pub fn sink(&self, handle: WatchHandle) -> Option<WatchSink<T>> {
        self.sinks().get(&handle.0).cloned()
    }

    /// Most recently registered sink, kept after `unwatch`. A shell uses it to
    /// deliver a callback that was already in flight when the watch was
    /// cleared.
    pub fn last_issued(&self) -> Option<WatchSink<T>> {
        self.last_issued
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> SensorProvider<T> for ShellSensor<T> {
    async fn watch(&self, sink: WatchSink<T>) -> Result<WatchHandle, PlatformError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(PlatformError::PermissionDenied("user declined".into()));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(PlatformError::Unavailable("sensor not present".into()));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        *self
            .last_issued
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sink.clone());
        self.sinks().insert(handle, sink);
        Ok(WatchHandle(handle))
    }

    fn unwatch(&self, handle: WatchHandle) -> Result<(), PlatformError> {
        self.sinks().remove(&handle.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shell_sensor_fans_out_and_unwatches() {
        let sensor: ShellSensor<u32> = ShellSensor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = sensor.watch(WatchSink::new(7, tx)).await.unwrap();

        assert_eq!(sensor.emit(1), 1);
        assert_eq!(rx.recv().await, Some((7, WatchEvent::Sample(1))));

        sensor.unwatch(handle).unwrap();
        assert_eq!(sensor.emit(2), 0);
        assert_eq!(sensor.active_watches(), 0);
    }

    #[tokio::test]
    async fn denied_permission_fails_watch() {
        let sensor: ShellSensor<u32> = ShellSensor::new();
        sensor.set_permission_denied(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = sensor.watch(WatchSink::new(1, tx)).await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn closed_sink_reports_false() {
        let (tx, rx) = mpsc::unbounded_channel::<(u64, WatchEvent<u8>)>();
        let sink = WatchSink::new(1, tx);
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.sample(3));
    }

    #[test]
    fn transient_errors_are_not_terminal() {
        assert!(!PlatformError::Failed("timeout".into()).is_terminal());
    }
}
