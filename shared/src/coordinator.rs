//! Keeps the device's sensors, wake lock and heartbeat alive while a child
//! session is active.
//!
//! Every `start` and `stop` bumps a generation counter. Resources acquired by
//! a start are only committed if its generation is still current, and every
//! event coming back from a watch carries the generation it was registered
//! under, so callbacks from a torn-down session never reach the engine.

use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{
    Capabilities, LocationProvider, MotionProvider, Notice, NoticeCode, Notifier, PlatformError,
    SensorProvider, Severity, SoundKind, WakeLockHandle, WakeLockProvider, WatchEvent,
    WatchHandle, WatchSink,
};
use crate::config::CoordinatorConfig;
use crate::gesture::{GestureEvent, ShakeDetector};
use crate::model::{
    ActionPayload, ChildCode, LatLon, LocationSample, MotionSample, SosAlert, SosTrigger,
    UnixTimeMs,
};
use crate::safe_zone::{SafeZone, ZoneTracker, ZoneTransition};
use crate::sync::{SubmitOutcome, SyncEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinatorState {
    #[default]
    Stopped,
    Starting,
    Running,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("location watch could not be established: {0}")]
    LocationWatch(PlatformError),

    #[error("start was superseded by a later start or stop")]
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sensor {
    Location,
    Motion,
}

impl Sensor {
    fn as_str(self) -> &'static str {
        match self {
            Sensor::Location => "location",
            Sensor::Motion => "motion",
        }
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type EventTx<T> = mpsc::UnboundedSender<(u64, WatchEvent<T>)>;
type EventRx<T> = mpsc::UnboundedReceiver<(u64, WatchEvent<T>)>;

/// Everything a session holds that must be given back on teardown.
#[derive(Default)]
struct Resources {
    tasks: Vec<JoinHandle<()>>,
    wake_lock: Option<WakeLockHandle>,
    location_watch: Option<WatchHandle>,
    motion_watch: Option<WatchHandle>,
}

struct Session {
    state: CoordinatorState,
    child: Option<ChildCode>,
    resources: Resources,
    last_heartbeat: Option<UnixTimeMs>,
    last_position: Option<LatLon>,
    shake: ShakeDetector,
    zone: ZoneTracker,
    degraded: bool,
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    engine: SyncEngine,
    location: Arc<LocationProvider>,
    motion: Arc<MotionProvider>,
    wake_lock: Arc<dyn WakeLockProvider>,
    notifier: Arc<dyn Notifier>,
    generation: AtomicU64,
    session: Mutex<Session>,
}

#[derive(Clone)]
pub struct BackgroundCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl fmt::Debug for BackgroundCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundCoordinator")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl BackgroundCoordinator {
    pub fn new(config: CoordinatorConfig, caps: &Capabilities, engine: SyncEngine) -> Self {
        let session = Session {
            state: CoordinatorState::Stopped,
            child: None,
            resources: Resources::default(),
            last_heartbeat: None,
            last_position: None,
            shake: ShakeDetector::new(config.shake.clone()),
            zone: ZoneTracker::new(config.safe_zone.clone()),
            degraded: false,
        };
        Self {
            inner: Arc::new(CoordinatorInner {
                engine,
                location: caps.location.clone(),
                motion: caps.motion.clone(),
                wake_lock: caps.wake_lock.clone(),
                notifier: caps.notifier.clone(),
                generation: AtomicU64::new(0),
                session: Mutex::new(session),
                config,
            }),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.inner.session.lock().unwrap_or_else(|poisoned| {
            warn!("coordinator session lock was poisoned, continuing with last state");
            poisoned.into_inner()
        })
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    pub fn state(&self) -> CoordinatorState {
        self.session().state
    }

    pub fn child(&self) -> Option<ChildCode> {
        self.session().child.clone()
    }

    pub fn last_heartbeat(&self) -> Option<UnixTimeMs> {
        self.session().last_heartbeat
    }

    pub fn last_position(&self) -> Option<LatLon> {
        self.session().last_position
    }

    /// Shakes counted in the current window. A window that has lapsed reads
    /// as zero even before the next sample arrives.
    pub fn shake_count(&self) -> u32 {
        let mut session = self.session();
        session.shake.expire(UnixTimeMs::now());
        session.shake.shake_count()
    }

    /// True when the wake lock or the motion watch could not be held.
    pub fn is_degraded(&self) -> bool {
        self.session().degraded
    }

    /// Swaps the tracked zone. The next fix decides the side again.
    pub fn set_safe_zone(&self, zone: Option<SafeZone>) {
        info!(has_zone = zone.is_some(), "safe zone updated");
        self.session().zone.set_zone(zone);
    }

    pub fn safe_zone(&self) -> Option<SafeZone> {
        self.session().zone.zone().cloned()
    }

    /// Starts background work for `child`. Returns false when the location
    /// watch cannot be established or the start was superseded.
    #[instrument(skip(self), fields(child = %child))]
    pub async fn start(&self, child: ChildCode) -> bool {
        match self.try_start(child).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "background start failed");
                false
            }
        }
    }

    pub async fn try_start(&self, child: ChildCode) -> Result<(), CoordinatorError> {
        let (generation, previous) = {
            let mut session = self.session();
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let previous = std::mem::take(&mut session.resources);
            session.state = CoordinatorState::Starting;
            session.child = Some(child.clone());
            session.degraded = false;
            session.shake = ShakeDetector::new(self.inner.config.shake.clone());
            let zone = session.zone.zone().cloned();
            session.zone.set_zone(zone);
            (generation, previous)
        };
        self.release(previous);
        debug!(generation, "starting background session");

        let wake_grant = match self.inner.wake_lock.acquire().await {
            Ok(grant) => Some(grant),
            Err(e) => {
                warn!(error = %e, "wake lock unavailable, running degraded");
                self.mark_degraded("wake_lock", &e);
                None
            }
        };

        let (location_tx, location_rx) = mpsc::unbounded_channel();
        let location_watch = match self
            .inner
            .location
            .watch(WatchSink::new(generation, location_tx.clone()))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "location watch failed, background session not started");
                self.announce_location_failure(&e);
                if let Some(grant) = wake_grant {
                    self.release_wake_lock(grant.handle);
                }
                let mut session = self.session();
                if self.is_current(generation) {
                    session.state = CoordinatorState::Stopped;
                    session.child = None;
                }
                return Err(CoordinatorError::LocationWatch(e));
            }
        };

        let (motion_tx, motion_rx) = mpsc::unbounded_channel();
        let motion_watch = match self
            .inner
            .motion
            .watch(WatchSink::new(generation, motion_tx.clone()))
            .await
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "motion watch failed, gesture detection off");
                self.inner.notifier.notify(
                    &Notice::new(NoticeCode::MotionUnavailable, Severity::Warning)
                        .with_context("reason", &e),
                );
                self.mark_degraded("motion", &e);
                None
            }
        };

        let mut session = self.session();
        if !self.is_current(generation) {
            drop(session);
            debug!(generation, "start superseded, releasing its resources");
            self.release(Resources {
                tasks: Vec::new(),
                wake_lock: wake_grant.map(|g| g.handle),
                location_watch: Some(location_watch),
                motion_watch,
            });
            return Err(CoordinatorError::Superseded);
        }

        let mut tasks = vec![
            tokio::spawn(
                self.clone()
                    .run_location(generation, location_rx, location_tx),
            ),
            tokio::spawn(self.clone().run_heartbeat(generation)),
        ];
        if motion_watch.is_some() {
            tasks.push(tokio::spawn(
                self.clone().run_motion(generation, motion_rx, motion_tx),
            ));
        }
        let wake_lock = wake_grant.map(|grant| {
            tasks.push(tokio::spawn(
                self.clone().run_wake_lock_watch(generation, grant.revoked),
            ));
            grant.handle
        });

        session.resources = Resources {
            tasks,
            wake_lock,
            location_watch: Some(location_watch),
            motion_watch,
        };
        session.state = CoordinatorState::Running;
        info!(generation, degraded = session.degraded, "background session running");
        Ok(())
    }

    /// Tears the session down. Every release step is attempted even if an
    /// earlier one fails.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        let (generation, resources, was) = {
            let mut session = self.session();
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let resources = std::mem::take(&mut session.resources);
            let was = std::mem::replace(&mut session.state, CoordinatorState::Stopped);
            session.child = None;
            (generation, resources, was)
        };
        self.release(resources);
        if was != CoordinatorState::Stopped {
            info!(generation, "background session stopped");
        }
    }

    fn release(&self, resources: Resources) {
        for task in resources.tasks {
            task.abort();
        }
        if let Some(handle) = resources.location_watch {
            self.unwatch(Sensor::Location, handle);
        }
        if let Some(handle) = resources.motion_watch {
            self.unwatch(Sensor::Motion, handle);
        }
        if let Some(handle) = resources.wake_lock {
            self.release_wake_lock(handle);
        }
    }

    fn unwatch(&self, sensor: Sensor, handle: WatchHandle) {
        let result = match sensor {
            Sensor::Location => self.inner.location.unwatch(handle),
            Sensor::Motion => self.inner.motion.unwatch(handle),
        };
        if let Err(e) = result {
            warn!(%sensor, handle = handle.0, error = %e, "failed to clear watch");
        }
    }

    fn release_wake_lock(&self, handle: WakeLockHandle) {
        if let Err(e) = self.inner.wake_lock.release(handle) {
            warn!(handle = handle.0, error = %e, "failed to release wake lock");
        }
    }

    fn mark_degraded(&self, resource: &'static str, reason: &PlatformError) {
        let first = {
            let mut session = self.session();
            !std::mem::replace(&mut session.degraded, true)
        };
        if first {
            self.inner.notifier.notify(
                &Notice::new(NoticeCode::DegradedMode, Severity::Warning)
                    .with_context("resource", resource)
                    .with_context("reason", reason),
            );
        }
    }

    fn announce_location_failure(&self, e: &PlatformError) {
        let notice = match e {
            PlatformError::PermissionDenied(_) => {
                Notice::new(NoticeCode::LocationPermissionDenied, Severity::Critical)
            }
            _ => Notice::new(NoticeCode::DegradedMode, Severity::Critical)
                .with_context("resource", "location"),
        };
        self.inner.notifier.notify(&notice.with_context("reason", e));
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let config = &self.inner.config;
        let exponent = attempt.saturating_sub(1).min(16);
        let base = config.watch_backoff_base_ms.saturating_mul(1u64 << exponent);
        let capped = base.min(config.watch_backoff_max_ms);
        let jitter = if config.watch_backoff_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=config.watch_backoff_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }

    fn watch_slot(session: &mut Session, sensor: Sensor) -> &mut Option<WatchHandle> {
        match sensor {
            Sensor::Location => &mut session.resources.location_watch,
            Sensor::Motion => &mut session.resources.motion_watch,
        }
    }

    /// Handles a watch error. Returns true if the watch was re-established
    /// and the consumer should keep reading.
    async fn recover_watch<T: Send + 'static>(
        &self,
        sensor: Sensor,
        provider: &Arc<dyn SensorProvider<T>>,
        generation: u64,
        tx: &EventTx<T>,
        error: PlatformError,
    ) -> bool {
        let stale = {
            let mut session = self.session();
            if !self.is_current(generation) {
                return false;
            }
            Self::watch_slot(&mut session, sensor).take()
        };
        if let Some(handle) = stale {
            self.unwatch(sensor, handle);
        }

        let mut error = error;
        let mut attempt = 0u32;
        loop {
            if error.is_terminal() {
                warn!(%sensor, error = %error, "watch stopped for good");
                match sensor {
                    Sensor::Location => self.announce_location_failure(&error),
                    Sensor::Motion => self.inner.notifier.notify(
                        &Notice::new(NoticeCode::MotionUnavailable, Severity::Warning)
                            .with_context("reason", &error),
                    ),
                }
                self.mark_degraded(sensor.as_str(), &error);
                return false;
            }

            attempt += 1;
            let delay = self.backoff_delay(attempt);
            warn!(
                %sensor,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "watch failed, restarting"
            );
            tokio::time::sleep(delay).await;
            if !self.is_current(generation) {
                return false;
            }

            match provider.watch(WatchSink::new(generation, tx.clone())).await {
                Ok(handle) => {
                    let committed = {
                        let mut session = self.session();
                        if self.is_current(generation) {
                            *Self::watch_slot(&mut session, sensor) = Some(handle);
                            true
                        } else {
                            false
                        }
                    };
                    if !committed {
                        self.unwatch(sensor, handle);
                        return false;
                    }
                    info!(%sensor, attempt, "watch restarted");
                    return true;
                }
                Err(e) => error = e,
            }
        }
    }

    async fn run_location(
        self,
        generation: u64,
        mut rx: EventRx<LocationSample>,
        tx: EventTx<LocationSample>,
    ) {
        let provider = self.inner.location.clone();
        while let Some((tagged, event)) = rx.recv().await {
            if tagged != generation || !self.is_current(generation) {
                debug!(tagged, generation, "ignoring stale location event");
                continue;
            }
            match event {
                WatchEvent::Sample(sample) => self.on_location(generation, sample).await,
                WatchEvent::Error(e) => {
                    if !self
                        .recover_watch(Sensor::Location, &provider, generation, &tx, e)
                        .await
                    {
                        break;
                    }
                }
            }
        }
    }

    async fn run_motion(
        self,
        generation: u64,
        mut rx: EventRx<MotionSample>,
        tx: EventTx<MotionSample>,
    ) {
        let provider = self.inner.motion.clone();
        while let Some((tagged, event)) = rx.recv().await {
            if tagged != generation || !self.is_current(generation) {
                continue;
            }
            match event {
                WatchEvent::Sample(sample) => self.on_motion(generation, &sample).await,
                WatchEvent::Error(e) => {
                    if !self
                        .recover_watch(Sensor::Motion, &provider, generation, &tx, e)
                        .await
                    {
                        break;
                    }
                }
            }
        }
    }

    async fn on_location(&self, generation: u64, sample: LocationSample) {
        let (child, transition) = {
            let mut session = self.session();
            if !self.is_current(generation) {
                return;
            }
            session.last_position = Some(sample.position);
            let transition = session.zone.update(sample.position);
            let label = session.zone.zone().and_then(|z| z.label.clone());
            (session.child.clone(), transition.map(|t| (t, label)))
        };
        let Some(child) = child else {
            return;
        };

        if let Some((transition, label)) = transition {
            self.announce_zone(&child, transition, label.as_deref());
        }

        let payload = ActionPayload::Location { child, sample };
        let engine = self.inner.engine.clone();
        let delivery = tokio::spawn(async move {
            if let Err(e) = engine.submit(payload).await {
                error!(error = %e, "location sample could not be recorded");
            }
        });
        // aborting the session task detaches the delivery, it does not cancel it
        if let Err(e) = delivery.await {
            error!(error = %e, "location delivery task failed");
        }
    }

    fn announce_zone(&self, child: &ChildCode, transition: ZoneTransition, label: Option<&str>) {
        let place = label.unwrap_or("the safe zone");
        match transition {
            ZoneTransition::Exited => {
                warn!(%child, place, "left safe zone");
                self.inner.notifier.notify(
                    &Notice::new(NoticeCode::SafeZoneExited, Severity::Warning)
                        .with_context("child", child)
                        .with_context("zone", place),
                );
                self.inner.notifier.play_sound(SoundKind::Alarm);
                self.inner
                    .notifier
                    .show_system_notification("Safe zone", &format!("{child} left {place}"));
            }
            ZoneTransition::Entered => {
                info!(%child, place, "back inside safe zone");
                self.inner.notifier.notify(
                    &Notice::new(NoticeCode::SafeZoneEntered, Severity::Info)
                        .with_context("child", child)
                        .with_context("zone", place),
                );
            }
        }
    }

    async fn on_motion(&self, generation: u64, sample: &MotionSample) {
        let (gesture, child, position) = {
            let mut session = self.session();
            if !self.is_current(generation) {
                return;
            }
            let gesture = session.shake.observe(sample);
            (gesture, session.child.clone(), session.last_position)
        };
        match gesture {
            Some(GestureEvent::Panic) => self.raise_panic(),
            Some(GestureEvent::Sos) => {
                if let Some(child) = child {
                    self.raise_sos(child, position, sample.timestamp).await;
                }
            }
            None => {}
        }
    }

    fn raise_panic(&self) {
        warn!("panic gesture detected");
        self.inner
            .notifier
            .notify(&Notice::new(NoticeCode::PanicGesture, Severity::Critical));
        self.inner.notifier.play_sound(SoundKind::Alarm);
        self.inner.notifier.show_system_notification(
            "Panic gesture",
            "Shake once more to send an SOS alert.",
        );
    }

    async fn raise_sos(&self, child: ChildCode, position: Option<LatLon>, at: UnixTimeMs) {
        error!(%child, has_position = position.is_some(), "SOS raised by gesture");
        let payload = ActionPayload::SosAlert {
            child: child.clone(),
            alert: SosAlert {
                position,
                raised_at: at,
                trigger: SosTrigger::Gesture,
            },
        };
        let engine = self.inner.engine.clone();
        let notifier = self.inner.notifier.clone();
        let delivery = tokio::spawn(async move {
            let delivery = match engine.submit(payload).await {
                Ok(SubmitOutcome::Delivered) => "sent",
                Ok(SubmitOutcome::Queued(_)) => "queued",
                Err(e) => {
                    error!(error = %e, "SOS alert could not be recorded");
                    "failed"
                }
            };

            notifier.notify(
                &Notice::new(NoticeCode::SosRaised, Severity::Critical)
                    .with_context("child", &child)
                    .with_context("delivery", delivery),
            );
            notifier.play_sound(SoundKind::Siren);
            let body = if delivery == "sent" {
                "Your parents have been alerted."
            } else {
                "Your alert will be sent as soon as you are back online."
            };
            notifier.show_system_notification("SOS", body);
        });
        if let Err(e) = delivery.await {
            error!(error = %e, "SOS delivery task failed");
        }
    }

    async fn run_heartbeat(self, generation: u64) {
        let period = self.inner.config.heartbeat_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let now = UnixTimeMs::now();
            let child = {
                let mut session = self.session();
                if !self.is_current(generation) {
                    return;
                }
                session.last_heartbeat = Some(now);
                session.shake.expire(now);
                session.child.clone()
            };

            self.inner
                .notifier
                .notify(&Notice::new(NoticeCode::Heartbeat, Severity::Debug));
            if let Some(child) = child {
                if self.inner.engine.connectivity().is_online() {
                    if let Err(e) = self.inner.engine.ping(&child, now).await {
                        debug!(error = %e, "heartbeat ping failed");
                    }
                }
            }
        }
    }

    /// One re-acquisition attempt per revocation.
    async fn run_wake_lock_watch(self, generation: u64, mut revoked: oneshot::Receiver<()>) {
        loop {
            if (&mut revoked).await.is_err() {
                return;
            }
            if !self.is_current(generation) {
                return;
            }
            warn!(generation, "wake lock revoked, re-acquiring");

            match self.inner.wake_lock.acquire().await {
                Ok(grant) => {
                    let committed = {
                        let mut session = self.session();
                        if self.is_current(generation) {
                            session.resources.wake_lock = Some(grant.handle);
                            true
                        } else {
                            false
                        }
                    };
                    if !committed {
                        self.release_wake_lock(grant.handle);
                        return;
                    }
                    revoked = grant.revoked;
                    info!(generation, "wake lock re-acquired");
                }
                Err(e) => {
                    warn!(error = %e, "wake lock re-acquisition failed");
                    if self.is_current(generation) {
                        self.session().resources.wake_lock = None;
                        self.mark_degraded("wake_lock", &e);
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{
        MemoryKv, MemoryRemote, QueuedNotifier, ShellSensor, ShellWakeLock, WakeLockGrant,
    };
    use crate::config::SyncConfig;
    use crate::connectivity::ConnectivityMonitor;
    use crate::offline_store::SnapshotCodec;
    use async_trait::async_trait;

    struct Rig {
        coordinator: BackgroundCoordinator,
        engine: SyncEngine,
        monitor: ConnectivityMonitor,
        location: Arc<ShellSensor<LocationSample>>,
        motion: Arc<ShellSensor<MotionSample>>,
        wake: Arc<ShellWakeLock>,
        remote: Arc<MemoryRemote>,
        notifier: Arc<QueuedNotifier>,
    }

    fn rig_with(online: bool, wake_lock: Arc<dyn WakeLockProvider>, wake: Arc<ShellWakeLock>) -> Rig {
        let location = Arc::new(ShellSensor::<LocationSample>::new());
        let motion = Arc::new(ShellSensor::<MotionSample>::new());
        let remote = Arc::new(MemoryRemote::new());
        let notifier = Arc::new(QueuedNotifier::default());
        let caps = Capabilities {
            kv: Arc::new(MemoryKv::new()),
            remote: remote.clone(),
            notifier: notifier.clone(),
            location: location.clone(),
            motion: motion.clone(),
            wake_lock,
            crypto: None,
        };
        let monitor = ConnectivityMonitor::new(online);
        let engine = SyncEngine::open(
            SyncConfig::default(),
            &caps,
            monitor.clone(),
            SnapshotCodec::plain(),
        )
        .unwrap();
        let coordinator =
            BackgroundCoordinator::new(CoordinatorConfig::default(), &caps, engine.clone());
        Rig {
            coordinator,
            engine,
            monitor,
            location,
            motion,
            wake,
            remote,
            notifier,
        }
    }

    fn rig(online: bool) -> Rig {
        let wake = Arc::new(ShellWakeLock::new());
        rig_with(online, wake.clone(), wake)
    }

    fn kid() -> ChildCode {
        ChildCode::new("KID7").unwrap()
    }

    fn fix(lat: f64, lon: f64) -> LocationSample {
        LocationSample::new(LatLon::new(lat, lon).unwrap(), 8.0, UnixTimeMs::now())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_acquires_everything_and_stop_releases_it() {
        let r = rig(true);
        assert!(r.coordinator.start(kid()).await);
        assert_eq!(r.coordinator.state(), CoordinatorState::Running);
        assert_eq!(r.location.active_watches(), 1);
        assert_eq!(r.motion.active_watches(), 1);
        assert_eq!(r.wake.held_count(), 1);
        assert!(!r.coordinator.is_degraded());

        r.coordinator.stop();
        assert_eq!(r.coordinator.state(), CoordinatorState::Stopped);
        assert_eq!(r.location.active_watches(), 0);
        assert_eq!(r.motion.active_watches(), 0);
        assert_eq!(r.wake.held_count(), 0);
        assert_eq!(r.coordinator.child(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_location_fails_start_and_releases_wake_lock() {
        let r = rig(true);
        r.location.set_permission_denied(true);

        assert!(!r.coordinator.start(kid()).await);
        assert_eq!(r.coordinator.state(), CoordinatorState::Stopped);
        assert_eq!(r.wake.held_count(), 0);
        assert_eq!(r.motion.active_watches(), 0);
        let notices = r.notifier.notices(NoticeCode::LocationPermissionDenied);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].severity, Severity::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_motion_and_wake_lock_degrade() {
        let wake = Arc::new(ShellWakeLock::new());
        wake.set_available(false);
        let r = rig_with(true, wake.clone(), wake);
        r.motion.set_available(false);

        assert!(r.coordinator.start(kid()).await);
        assert!(r.coordinator.is_degraded());
        assert_eq!(r.notifier.notices(NoticeCode::MotionUnavailable).len(), 1);
        // noticed once even though two resources are missing
        assert_eq!(r.notifier.notices(NoticeCode::DegradedMode).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn location_fixes_reach_the_engine() {
        let r = rig(true);
        r.coordinator.start(kid()).await;
        r.location.emit(fix(10.0, 20.0).with_battery(50));
        settle().await;

        let child = r.remote.snapshot("children/KID7").unwrap();
        assert_eq!(child["battery"], serde_json::json!(50));
        assert_eq!(r.coordinator.last_position(), Some(LatLon::new(10.0, 20.0).unwrap()));

        r.monitor.set_online(false);
        r.location.emit(fix(10.1, 20.0));
        settle().await;
        assert_eq!(r.engine.status().queued_action_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_from_a_stopped_session_are_ignored() {
        let r = rig(true);
        r.coordinator.start(kid()).await;
        let old_sink = r.location.last_issued().unwrap();
        r.coordinator.stop();
        r.coordinator.start(kid()).await;

        old_sink.sample(fix(1.0, 1.0));
        settle().await;
        assert_eq!(r.remote.write_count(), 0);
        assert_eq!(r.coordinator.last_position(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn shaking_raises_panic_then_sos() {
        let r = rig(false);
        r.coordinator.start(kid()).await;
        r.location.emit(fix(5.0, 5.0));
        settle().await;

        let base = UnixTimeMs::now();
        for (i, offset) in [0u64, 600, 1200].iter().enumerate() {
            let x = if i % 2 == 0 { 20.0 } else { -20.0 };
            r.motion.emit(MotionSample::new(x, 0.0, 0.0, base.add_millis(*offset)));
        }
        settle().await;
        assert_eq!(r.notifier.notices(NoticeCode::PanicGesture).len(), 1);
        assert_eq!(r.coordinator.shake_count(), 3);

        r.motion.emit(MotionSample::new(-20.0, 0.0, 0.0, base.add_millis(1800)));
        settle().await;
        assert_eq!(r.coordinator.shake_count(), 0);
        let sos = r.notifier.notices(NoticeCode::SosRaised);
        assert_eq!(sos.len(), 1);
        assert_eq!(sos[0].get("delivery"), Some("queued"));
        assert_eq!(r.notifier.sounds(), vec![SoundKind::Alarm, SoundKind::Siren]);

        let queued = r.engine.queued_actions();
        let alert = queued
            .iter()
            .find_map(|a| match &a.payload {
                ActionPayload::SosAlert { alert, .. } => Some(alert.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(alert.position, Some(LatLon::new(5.0, 5.0).unwrap()));
        assert_eq!(alert.trigger, SosTrigger::Gesture);
    }

    #[tokio::test(start_paused = true)]
    async fn sos_in_flight_survives_stop() {
        let r = rig(true);
        r.coordinator.start(kid()).await;
        r.remote.set_latency(Duration::from_secs(5));

        let base = UnixTimeMs::now();
        for (i, offset) in [0u64, 600, 1200, 1800].iter().enumerate() {
            let x = if i % 2 == 0 { 20.0 } else { -20.0 };
            r.motion.emit(MotionSample::new(x, 0.0, 0.0, base.add_millis(*offset)));
        }
        settle().await;
        r.coordinator.stop();

        tokio::time::sleep(Duration::from_secs(30)).await;
        let alerts = r.remote.snapshot("sosAlerts").unwrap();
        assert_eq!(alerts.as_object().unwrap().len(), 1);
        assert_eq!(r.engine.status().queued_action_count, 0);
        let sos = r.notifier.notices(NoticeCode::SosRaised);
        assert_eq!(sos.len(), 1);
        assert_eq!(sos[0].get("delivery"), Some("sent"));
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_shake_window_reads_as_zero() {
        let r = rig(true);
        r.coordinator.start(kid()).await;

        let base = UnixTimeMs(UnixTimeMs::now().0 - 10_000);
        r.motion.emit(MotionSample::new(20.0, 0.0, 0.0, base));
        r.motion.emit(MotionSample::new(-20.0, 0.0, 0.0, base.add_millis(600)));
        settle().await;

        assert_eq!(r.coordinator.shake_count(), 0);
        assert!(r.notifier.notices(NoticeCode::PanicGesture).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_watch_error_restarts_within_generation() {
        let r = rig(true);
        r.coordinator.start(kid()).await;
        let generation = r.coordinator.generation();

        r.location.emit_error(PlatformError::Failed("timeout".into()));
        settle().await;
        assert_eq!(r.location.active_watches(), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(r.location.active_watches(), 1);
        assert_eq!(r.location.last_issued().unwrap().generation(), generation);

        r.location.emit(fix(3.0, 3.0));
        settle().await;
        assert!(r.remote.snapshot("children/KID7/location").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_motion_error_turns_gestures_off() {
        let r = rig(true);
        r.coordinator.start(kid()).await;
        r.motion
            .emit_error(PlatformError::PermissionDenied("revoked".into()));
        settle().await;

        assert_eq!(r.motion.active_watches(), 0);
        assert!(r.coordinator.is_degraded());
        assert_eq!(r.coordinator.state(), CoordinatorState::Running);
        assert_eq!(r.notifier.notices(NoticeCode::MotionUnavailable).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_wake_lock_is_reacquired_once() {
        let r = rig(true);
        r.coordinator.start(kid()).await;
        assert_eq!(r.wake.revoke_all(), 1);
        settle().await;
        assert_eq!(r.wake.acquisitions(), 2);
        assert_eq!(r.wake.held_count(), 1);

        r.wake.set_available(false);
        r.wake.revoke_all();
        settle().await;
        assert_eq!(r.wake.acquisitions(), 2);
        assert!(r.coordinator.is_degraded());
        assert_eq!(r.coordinator.state(), CoordinatorState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_while_online() {
        let r = rig(true);
        r.coordinator.start(kid()).await;
        assert_eq!(r.coordinator.last_heartbeat(), None);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(r.coordinator.last_heartbeat().is_some());
        assert!(r.remote.snapshot("children/KID7/ping").is_some());
        assert_eq!(r.notifier.notices(NoticeCode::Heartbeat).len(), 1);

        r.coordinator.stop();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(r.notifier.notices(NoticeCode::Heartbeat).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_the_safe_zone_sounds_the_alarm() {
        let r = rig(true);
        let zone = SafeZone::new(LatLon::new(0.0, 0.0).unwrap(), 100.0)
            .unwrap()
            .with_label("home");
        r.coordinator.set_safe_zone(Some(zone));
        r.coordinator.start(kid()).await;

        r.location.emit(fix(0.0, 0.0));
        settle().await;
        assert!(r.notifier.notices(NoticeCode::SafeZoneExited).is_empty());

        r.location.emit(fix(0.01, 0.0));
        settle().await;
        let exits = r.notifier.notices(NoticeCode::SafeZoneExited);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].get("zone"), Some("home"));
        assert_eq!(r.notifier.sounds(), vec![SoundKind::Alarm]);

        r.location.emit(fix(0.0, 0.0));
        settle().await;
        assert_eq!(r.notifier.notices(NoticeCode::SafeZoneEntered).len(), 1);
    }

    /// Holds `acquire` open long enough for a `stop` to land mid-start.
    struct SlowWakeLock(Arc<ShellWakeLock>);

    #[async_trait]
    impl WakeLockProvider for SlowWakeLock {
        async fn acquire(&self) -> Result<WakeLockGrant, PlatformError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.0.acquire().await
        }

        fn release(&self, handle: WakeLockHandle) -> Result<(), PlatformError> {
            self.0.release(handle)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_start_releases_late_resources() {
        let wake = Arc::new(ShellWakeLock::new());
        let r = rig_with(true, Arc::new(SlowWakeLock(wake.clone())), wake);

        let coordinator = r.coordinator.clone();
        let starting = tokio::spawn(async move { coordinator.start(kid()).await });
        settle().await;
        assert_eq!(r.coordinator.state(), CoordinatorState::Starting);

        r.coordinator.stop();
        assert!(!starting.await.unwrap());
        assert_eq!(r.coordinator.state(), CoordinatorState::Stopped);
        assert_eq!(r.wake.held_count(), 0);
        assert_eq!(r.location.active_watches(), 0);
        assert_eq!(r.motion.active_watches(), 0);
    }
}
