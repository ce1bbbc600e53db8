//! Offline queue owner and drain loop.
//!
//! [`SyncEngine`] is the only writer of the durable queue and offline cache.
//! Producers either [`submit`](SyncEngine::submit) (try the network first,
//! queue on failure) or [`enqueue`](SyncEngine::enqueue) directly. The queue
//! is written to the durable store before `enqueue` returns, and drained in
//! FIFO order whenever connectivity allows.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{
    Capabilities, DurableStore, KeyNamespace, KvKey, Notice, NoticeCode, Notifier, RemoteError,
    RemotePath, RemoteStore, Severity,
};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::model::{
    ActionId, ActionKind, ActionPayload, ChildCode, LocationSample, QueuedAction, UnixTimeMs,
};
use crate::offline_store::{OfflineCache, SnapshotCodec, StoreError};
use crate::outbox::{ActionQueue, OutboxError, Verdict};
use crate::safe_zone::SafeZone;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error("local store failure: {0}")]
    Store(#[from] StoreError),

    #[error("action {0} was already delivered")]
    AlreadyDelivered(ActionId),
}

impl From<crate::capabilities::KvError> for SyncError {
    fn from(e: crate::capabilities::KvError) -> Self {
        SyncError::Store(StoreError::Kv(e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub is_online: bool,
    pub queued_action_count: usize,
    pub last_sync_timestamp: Option<UnixTimeMs>,
    pub sync_in_progress: bool,
    pub dropped_last_drain: usize,
    pub dropped_total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    pub retried: usize,
    pub dropped: usize,
    pub remaining: usize,
    pub finished_at: UnixTimeMs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    /// Nothing was queued.
    Idle,
    Offline,
    /// Another drain holds the single-flight slot.
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Delivered,
    Queued(ActionId),
}

/// Result of a two-path write. The writes are independent; a partial
/// success is reported as-is and never rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualWriteReport {
    pub parent: Result<(), RemoteError>,
    pub child: Result<(), RemoteError>,
}

impl DualWriteReport {
    pub fn is_complete(&self) -> bool {
        self.parent.is_ok() && self.child.is_ok()
    }

    pub fn is_partial(&self) -> bool {
        self.parent.is_ok() != self.child.is_ok()
    }
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    direct_deliveries: AtomicU64,
    failed_attempts: AtomicU64,
    dropped: AtomicU64,
    persist_errors: AtomicU64,
    duplicates_rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub delivered: u64,
    pub direct_deliveries: u64,
    pub failed_attempts: u64,
    pub dropped: u64,
    pub persist_errors: u64,
    pub duplicates_rejected: u64,
}

impl SyncMetrics {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            direct_deliveries: self.direct_deliveries.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            persist_errors: self.persist_errors.load(Ordering::Relaxed),
            duplicates_rejected: self.duplicates_rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct QueueRecord {
    actions: Vec<QueuedAction>,
    last_sync: Option<UnixTimeMs>,
    dropped_total: u64,
}

struct EngineState {
    queue: ActionQueue,
    cache: OfflineCache,
    last_sync: Option<UnixTimeMs>,
    dropped_last_drain: usize,
    dropped_total: u64,
    delivered: LruCache<ActionId, UnixTimeMs>,
}

struct EngineInner {
    config: SyncConfig,
    kv: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteStore>,
    notifier: Arc<dyn Notifier>,
    connectivity: ConnectivityMonitor,
    codec: SnapshotCodec,
    queue_key: KvKey,
    cache_key: KvKey,
    state: Mutex<EngineState>,
    draining: AtomicBool,
    metrics: SyncMetrics,
}

/// Releases the single-flight slot on every exit path.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn location_value(sample: &LocationSample) -> Value {
    json!({
        "lat": sample.position.lat(),
        "lng": sample.position.lon(),
        "accuracy": sample.accuracy_m,
        "timestamp": sample.timestamp.0,
    })
}

impl SyncEngine {
    /// Loads the persisted queue and cache. A corrupt blob is copied to the
    /// quarantine namespace and replaced by an empty one; a blob written by
    /// a newer schema is an error so it is never overwritten.
    pub fn open(
        config: SyncConfig,
        caps: &Capabilities,
        connectivity: ConnectivityMonitor,
        codec: SnapshotCodec,
    ) -> Result<Self, SyncError> {
        let queue_key = KvKey::new(KeyNamespace::Outbox, "pending")?;
        let cache_key = KvKey::new(KeyNamespace::Cache, "offline")?;

        let record: Option<QueueRecord> = load_blob(caps.kv.as_ref(), &codec, &queue_key)?;
        let mut cache: OfflineCache = load_blob(caps.kv.as_ref(), &codec, &cache_key)?
            .unwrap_or_else(|| OfflineCache::new(config.cache_capacity));
        cache.set_capacity(config.cache_capacity);

        let (queue, last_sync, dropped_total) = match record {
            Some(r) => (
                ActionQueue::restore(r.actions, config.max_queue_entries),
                r.last_sync,
                r.dropped_total,
            ),
            None => (ActionQueue::new(config.max_queue_entries), None, 0),
        };

        let delivered_cap =
            NonZeroUsize::new(config.delivered_id_cache).unwrap_or(NonZeroUsize::MIN);

        info!(
            queued = queue.len(),
            sealed = codec.is_sealed(),
            "sync engine opened"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                kv: caps.kv.clone(),
                remote: caps.remote.clone(),
                notifier: caps.notifier.clone(),
                connectivity,
                codec,
                queue_key,
                cache_key,
                state: Mutex::new(EngineState {
                    queue,
                    cache,
                    last_sync,
                    dropped_last_drain: 0,
                    dropped_total,
                    delivered: LruCache::new(delivered_cap),
                }),
                draining: AtomicBool::new(false),
                metrics: SyncMetrics::default(),
                config,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| {
            warn!("sync state lock was poisoned, continuing with last state");
            poisoned.into_inner()
        })
    }

    fn persist_queue(&self, state: &EngineState) -> Result<(), SyncError> {
        let record = QueueRecord {
            actions: state.queue.snapshot(),
            last_sync: state.last_sync,
            dropped_total: state.dropped_total,
        };
        let bytes = self.inner.codec.encode(&record)?;
        self.inner.kv.set(&self.inner.queue_key, &bytes)?;
        Ok(())
    }

    fn persist_cache(&self, state: &EngineState) -> Result<(), SyncError> {
        let bytes = self.inner.codec.encode(&state.cache)?;
        self.inner.kv.set(&self.inner.cache_key, &bytes)?;
        Ok(())
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    #[instrument(skip(self, payload), fields(kind = %payload.kind()))]
    pub fn enqueue(&self, payload: ActionPayload) -> Result<ActionId, SyncError> {
        self.enqueue_action(QueuedAction::new(payload, UnixTimeMs::now()))
    }

    /// Queues an action that carries its own id. Ids that are queued or
    /// were recently delivered are rejected.
    pub fn enqueue_action(&self, action: QueuedAction) -> Result<ActionId, SyncError> {
        let id = action.id.clone();
        let kind = action.kind();
        {
            let mut state = self.state();
            if state.delivered.contains(&id) {
                SyncMetrics::bump(&self.inner.metrics.duplicates_rejected, 1);
                return Err(SyncError::AlreadyDelivered(id));
            }
            if let Err(e) = state.queue.push(action) {
                if matches!(e, OutboxError::DuplicateId(_)) {
                    SyncMetrics::bump(&self.inner.metrics.duplicates_rejected, 1);
                }
                return Err(e.into());
            }
            if let Err(e) = self.persist_queue(&state) {
                state.queue.remove(&id);
                SyncMetrics::bump(&self.inner.metrics.persist_errors, 1);
                error!(action_id = %id, error = %e, "failed to persist queue, enqueue rolled back");
                return Err(e);
            }
        }

        SyncMetrics::bump(&self.inner.metrics.enqueued, 1);
        info!(action_id = %id, kind = %kind, "action queued");

        if self.inner.connectivity.is_online() {
            self.spawn_drain();
        }
        Ok(id)
    }

    fn spawn_drain(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let engine = self.clone();
                handle.spawn(async move {
                    engine.drain().await;
                });
            }
            Err(_) => debug!("no runtime available, action waits for the next drain trigger"),
        }
    }

    /// Delivers queued actions in FIFO order. Works on a snapshot: actions
    /// removed by `clear` are not resurrected, and actions queued while the
    /// drain runs get one follow-up drain once this one lets go.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> DrainOutcome {
        let Some(guard) = DrainGuard::acquire(&self.inner.draining) else {
            debug!("drain already in flight");
            return DrainOutcome::AlreadyRunning;
        };
        let snapshot = self.state().queue.snapshot();
        let outcome = self.drain_snapshot(&snapshot).await;
        drop(guard);

        if self.inner.connectivity.is_online() {
            let arrived = self
                .state()
                .queue
                .iter()
                .any(|queued| !snapshot.iter().any(|a| a.id == queued.id));
            if arrived {
                debug!("actions queued mid-drain, scheduling a follow-up");
                self.spawn_drain();
            }
        }
        outcome
    }

    async fn drain_snapshot(&self, snapshot: &[QueuedAction]) -> DrainOutcome {
        if !self.inner.connectivity.is_online() {
            debug!("offline, skipping drain");
            return DrainOutcome::Offline;
        }
        if snapshot.is_empty() {
            return DrainOutcome::Idle;
        }
        info!(count = snapshot.len(), "draining outbox");

        let mut verdicts = Vec::with_capacity(snapshot.len());
        for action in snapshot {
            if !self.inner.connectivity.is_online() {
                info!(
                    left = snapshot.len() - verdicts.len(),
                    "went offline mid-drain, leaving the rest queued"
                );
                break;
            }
            let verdict = match self.dispatch(&action.payload).await {
                Ok(()) => {
                    debug!(action_id = %action.id, kind = %action.kind(), "delivered");
                    Verdict::Delivered
                }
                Err(e) => {
                    SyncMetrics::bump(&self.inner.metrics.failed_attempts, 1);
                    warn!(
                        action_id = %action.id,
                        kind = %action.kind(),
                        attempt = action.retry_count + 1,
                        category = ?e.category(),
                        code = e.code(),
                        error = %e,
                        "dispatch failed"
                    );
                    Verdict::Failed
                }
            };
            verdicts.push((action.id.clone(), verdict));
        }

        let now = UnixTimeMs::now();
        let (applied, remaining, persisted) = {
            let mut state = self.state();
            let applied = state.queue.apply(&verdicts, self.inner.config.max_retries);
            for id in &applied.delivered {
                state.delivered.put(id.clone(), now);
            }
            state.last_sync = Some(now);
            state.dropped_last_drain = applied.dropped.len();
            state.dropped_total += applied.dropped.len() as u64;
            let persisted = self.persist_queue(&state);
            (applied, state.queue.len(), persisted)
        };

        if let Err(e) = persisted {
            SyncMetrics::bump(&self.inner.metrics.persist_errors, 1);
            error!(error = %e, "failed to persist queue after drain, stored copy is stale");
        }

        for action in &applied.dropped {
            error!(
                action_id = %action.id,
                kind = %action.kind(),
                retry_count = action.retry_count,
                "action dropped after exhausting its retry budget"
            );
            self.inner.notifier.notify(
                &Notice::new(NoticeCode::ActionDropped, Severity::Warning)
                    .with_context("action_id", &action.id)
                    .with_context("kind", action.kind()),
            );
        }

        let metrics = &self.inner.metrics;
        SyncMetrics::bump(&metrics.delivered, applied.delivered.len() as u64);
        SyncMetrics::bump(&metrics.dropped, applied.dropped.len() as u64);

        let report = DrainReport {
            attempted: verdicts.len(),
            delivered: applied.delivered.len(),
            retried: applied.retried.len(),
            dropped: applied.dropped.len(),
            remaining,
            finished_at: now,
        };
        info!(
            delivered = report.delivered,
            retried = report.retried,
            dropped = report.dropped,
            remaining = report.remaining,
            "drain finished"
        );

        let severity = if report.dropped > 0 {
            Severity::Warning
        } else {
            Severity::Info
        };
        self.inner.notifier.notify(
            &Notice::new(NoticeCode::SyncCompleted, severity)
                .with_context("succeeded", report.delivered)
                .with_context("attempted", report.attempted)
                .with_context("dropped", report.dropped),
        );

        DrainOutcome::Completed(report)
    }

    async fn dispatch(&self, payload: &ActionPayload) -> Result<(), RemoteError> {
        match tokio::time::timeout(self.inner.config.dispatch_timeout(), self.write(payload)).await
        {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    async fn write(&self, payload: &ActionPayload) -> Result<(), RemoteError> {
        let remote = &self.inner.remote;
        match payload {
            ActionPayload::Location { child, sample } => {
                let point = location_value(sample);
                let mut fields = Map::new();
                fields.insert("location".into(), point.clone());
                fields.insert("lastSeen".into(), json!(sample.timestamp.0));
                if let Some(battery) = sample.battery {
                    fields.insert("battery".into(), json!(battery));
                }
                remote.update(&RemotePath::child(child), fields).await?;
                remote
                    .push(&RemotePath::location_history(child), point)
                    .await?;
            }
            ActionPayload::Message { child, message } => {
                remote
                    .push(
                        &RemotePath::chat_messages(child),
                        json!({
                            "sender": message.sender,
                            "text": message.text,
                            "timestamp": message.sent_at.0,
                        }),
                    )
                    .await?;
            }
            ActionPayload::SosAlert { child, alert } => {
                let location = alert
                    .position
                    .map(|p| json!({ "lat": p.lat(), "lng": p.lon() }));
                remote
                    .push(
                        &RemotePath::sos_alerts(),
                        json!({
                            "childCode": child.as_str(),
                            "location": location,
                            "timestamp": alert.raised_at.0,
                            "trigger": alert.trigger.as_str(),
                            "status": "active",
                        }),
                    )
                    .await?;
            }
            ActionPayload::StatusChange { child, status } => {
                remote
                    .set(&RemotePath::child_status(child), json!(status))
                    .await?;
            }
        }
        Ok(())
    }

    /// Sends now when online, otherwise (or when sending fails) queues.
    /// The payload is cached for offline display either way.
    #[instrument(skip(self, payload), fields(kind = %payload.kind()))]
    pub async fn submit(&self, payload: ActionPayload) -> Result<SubmitOutcome, SyncError> {
        self.record_in_cache(&payload);

        if self.inner.connectivity.is_online() {
            match self.dispatch(&payload).await {
                Ok(()) => {
                    SyncMetrics::bump(&self.inner.metrics.direct_deliveries, 1);
                    return Ok(SubmitOutcome::Delivered);
                }
                Err(e) => {
                    warn!(error = %e, category = ?e.category(), "direct dispatch failed, queueing");
                }
            }
        }

        let kind = payload.kind();
        let id = self.enqueue(payload)?;
        if kind != ActionKind::Location {
            let severity = if kind == ActionKind::SosAlert {
                Severity::Warning
            } else {
                Severity::Info
            };
            self.inner.notifier.notify(
                &Notice::new(NoticeCode::ActionQueued, severity)
                    .with_context("kind", kind)
                    .with_context("action_id", &id),
            );
        }
        Ok(SubmitOutcome::Queued(id))
    }

    fn record_in_cache(&self, payload: &ActionPayload) {
        let mut state = self.state();
        if state.cache.record(payload) {
            if let Err(e) = self.persist_cache(&state) {
                SyncMetrics::bump(&self.inner.metrics.persist_errors, 1);
                warn!(error = %e, "failed to persist offline cache");
            }
        }
    }

    /// Best-effort liveness write. Never queued.
    pub async fn ping(&self, child: &ChildCode, now: UnixTimeMs) -> Result<(), RemoteError> {
        if !self.inner.connectivity.is_online() {
            return Err(RemoteError::Network("offline".into()));
        }
        let path = RemotePath::child_ping(child);
        let write = self.inner.remote.set(&path, json!(now.0));
        match tokio::time::timeout(self.inner.config.dispatch_timeout(), write).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    /// Writes the zone under the parent and under the child independently.
    #[instrument(skip(self, zone), fields(child = %child))]
    pub async fn publish_safe_zone(
        &self,
        parent_uid: &str,
        child: &ChildCode,
        zone: &SafeZone,
    ) -> DualWriteReport {
        let value = zone.to_remote_value();
        let timeout = self.inner.config.dispatch_timeout();
        let remote = &self.inner.remote;

        let parent_write = async {
            let path = RemotePath::parent_safe_zone(parent_uid, child)
                .ok_or_else(|| RemoteError::Rejected("invalid parent uid".into()))?;
            tokio::time::timeout(timeout, remote.set(&path, value.clone()))
                .await
                .unwrap_or(Err(RemoteError::Timeout))
        };
        let child_write = async {
            tokio::time::timeout(
                timeout,
                remote.set(&RemotePath::child_safe_zone(child), value.clone()),
            )
            .await
            .unwrap_or(Err(RemoteError::Timeout))
        };

        let (parent, child_result) = tokio::join!(parent_write, child_write);
        let report = DualWriteReport {
            parent,
            child: child_result,
        };
        if report.is_partial() {
            warn!(?report, "safe zone only partially published");
        } else if let Err(e) = &report.parent {
            warn!(error = %e, "safe zone publish failed");
        } else {
            info!("safe zone published");
        }
        report
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.state();
        SyncStatus {
            is_online: self.inner.connectivity.is_online(),
            queued_action_count: state.queue.len(),
            last_sync_timestamp: state.last_sync,
            sync_in_progress: self.inner.draining.load(Ordering::Acquire),
            dropped_last_drain: state.dropped_last_drain,
            dropped_total: state.dropped_total,
        }
    }

    pub fn queued_actions(&self) -> Vec<QueuedAction> {
        self.state().queue.snapshot()
    }

    pub fn offline_cache(&self) -> OfflineCache {
        self.state().cache.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Empties the queue and the offline cache, on disk too.
    pub fn clear(&self) -> Result<(), SyncError> {
        let mut state = self.state();
        let dropped = state.queue.len();
        state.queue.clear();
        state.cache.clear();
        self.persist_queue(&state)?;
        self.persist_cache(&state)?;
        info!(dropped, "outbox and offline cache cleared");
        Ok(())
    }

    /// Drains on reconnect, on foreground hints and on a fallback tick while
    /// online with work queued. Stops when `shutdown` flips to true or its
    /// sender is dropped.
    pub fn spawn_auto_sync(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        // subscribed here so transitions before the task's first poll are seen
        let online_rx = self.inner.connectivity.subscribe();
        let engine = self.clone();
        tokio::spawn(async move { engine.run_auto_sync(online_rx, shutdown).await })
    }

    async fn run_auto_sync(
        self,
        mut online_rx: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let monitor = self.inner.connectivity.clone();
        let period = self.inner.config.fallback_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("auto-sync started");
        if monitor.is_online() && self.status().queued_action_count > 0 {
            self.drain().await;
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    if online {
                        self.inner.notifier.notify(
                            &Notice::new(NoticeCode::ConnectivityRestored, Severity::Info),
                        );
                        self.drain().await;
                    } else {
                        self.inner.notifier.notify(
                            &Notice::new(NoticeCode::ConnectivityLost, Severity::Warning),
                        );
                    }
                }
                () = monitor.drain_requested() => {
                    self.drain().await;
                }
                _ = ticker.tick() => {
                    if monitor.is_online() && self.status().queued_action_count > 0 {
                        debug!("fallback tick");
                        self.drain().await;
                    }
                }
            }
        }
        info!("auto-sync stopped");
    }
}

fn load_blob<T: serde::de::DeserializeOwned>(
    kv: &dyn DurableStore,
    codec: &SnapshotCodec,
    key: &KvKey,
) -> Result<Option<T>, SyncError> {
    let Some(bytes) = kv.get(key)? else {
        return Ok(None);
    };
    match codec.decode(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_corruption() => {
            error!(key = %key.raw(), error = %e, "stored blob is unreadable, quarantining it");
            let quarantine = KvKey::new(
                KeyNamespace::Quarantine,
                format!("{}-{}", key.key(), UnixTimeMs::now().0),
            )?;
            if let Err(qe) = kv.set(&quarantine, &bytes) {
                warn!(error = %qe, "could not copy unreadable blob to quarantine");
            }
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}
