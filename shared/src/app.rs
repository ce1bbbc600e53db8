//! Composition root. Builds the monitor, engine and coordinator from one
//! config and one set of capabilities, and owns the auto-sync driver.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::capabilities::Capabilities;
use crate::config::{ConfigError, HavenConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::coordinator::BackgroundCoordinator;
use crate::model::{
    ActionPayload, ChatMessage, ChildCode, LatLon, ModelError, SosAlert, SosTrigger, UnixTimeMs,
};
use crate::offline_store::{SnapshotCodec, StoreContext};
use crate::safe_zone::SafeZone;
use crate::sync::{DualWriteReport, SubmitOutcome, SyncEngine, SyncError, SyncStatus};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

pub struct HavenCore {
    config: HavenConfig,
    connectivity: ConnectivityMonitor,
    engine: SyncEngine,
    coordinator: BackgroundCoordinator,
    shutdown: watch::Sender<bool>,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HavenCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HavenCore")
            .field("engine", &self.engine)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl HavenCore {
    /// Validates `config` and loads the persisted queue. `online` seeds the
    /// connectivity monitor until the platform reports otherwise.
    pub fn new(config: HavenConfig, caps: Capabilities, online: bool) -> Result<Self, CoreError> {
        config.validate()?;

        let codec = match &caps.crypto {
            Some(crypto) => SnapshotCodec::sealed(
                crypto.clone(),
                StoreContext::new(&config.store.store_name, &config.store.device_id),
            ),
            None => SnapshotCodec::plain(),
        };
        let connectivity = ConnectivityMonitor::new(online);
        let engine = SyncEngine::open(config.sync.clone(), &caps, connectivity.clone(), codec)?;
        let coordinator =
            BackgroundCoordinator::new(config.coordinator.clone(), &caps, engine.clone());
        let (shutdown, _) = watch::channel(false);

        info!(
            online,
            sealed = caps.crypto.is_some(),
            store = %config.store.store_name,
            "haven core ready"
        );

        Ok(Self {
            config,
            connectivity,
            engine,
            coordinator,
            shutdown,
            auto_sync: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &HavenConfig {
        &self.config
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn coordinator(&self) -> &BackgroundCoordinator {
        &self.coordinator
    }

    pub fn status(&self) -> SyncStatus {
        self.engine.status()
    }

    /// Spawns the auto-sync driver. Returns false if it is already running.
    pub fn start_auto_sync(&self) -> bool {
        let mut slot = self
            .auto_sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        self.shutdown.send_replace(false);
        *slot = Some(self.engine.spawn_auto_sync(self.shutdown.subscribe()));
        true
    }

    pub async fn start_background(&self, child: ChildCode) -> bool {
        self.coordinator.start(child).await
    }

    pub fn stop_background(&self) {
        self.coordinator.stop();
    }

    pub async fn send_message(
        &self,
        child: ChildCode,
        sender: &str,
        text: &str,
    ) -> Result<SubmitOutcome, CoreError> {
        let message = ChatMessage::new(sender, text, UnixTimeMs::now())?;
        Ok(self
            .engine
            .submit(ActionPayload::Message { child, message })
            .await?)
    }

    /// Manual SOS from the UI. Falls back to the coordinator's last fix when
    /// no position is given.
    pub async fn raise_sos(
        &self,
        child: ChildCode,
        position: Option<LatLon>,
        trigger: SosTrigger,
    ) -> Result<SubmitOutcome, CoreError> {
        let alert = SosAlert {
            position: position.or_else(|| self.coordinator.last_position()),
            raised_at: UnixTimeMs::now(),
            trigger,
        };
        Ok(self
            .engine
            .submit(ActionPayload::SosAlert { child, alert })
            .await?)
    }

    pub async fn set_status(
        &self,
        child: ChildCode,
        status: impl Into<String>,
    ) -> Result<SubmitOutcome, CoreError> {
        let status = status.into();
        if status.trim().is_empty() {
            return Err(ModelError::Validation("status must not be empty".into()).into());
        }
        Ok(self
            .engine
            .submit(ActionPayload::StatusChange { child, status })
            .await?)
    }

    /// Publishes the zone for the parent and the child, and starts tracking
    /// it locally.
    pub async fn set_safe_zone(
        &self,
        parent_uid: &str,
        child: &ChildCode,
        zone: SafeZone,
    ) -> Result<DualWriteReport, CoreError> {
        zone.validate()?;
        let report = self.engine.publish_safe_zone(parent_uid, child, &zone).await;
        self.coordinator.set_safe_zone(Some(zone));
        Ok(report)
    }

    /// Stops background work and the auto-sync driver. An in-flight drain is
    /// given a short grace period to finish.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.coordinator.stop();
        self.shutdown.send_replace(true);

        let handle = self
            .auto_sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "auto-sync task ended abnormally"),
                Err(_) => {
                    warn!("auto-sync did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
        info!(queued = self.engine.status().queued_action_count, "haven core shut down");
    }
}
