//! Offline-resilient core for the Haven family safety app.
//!
//! Child devices keep reporting location, chat, status and SOS alerts while
//! connectivity comes and goes. Everything the child produces goes through
//! [`SyncEngine::submit`]: sent immediately when possible, otherwise written
//! to a durable FIFO queue and drained on reconnect. The
//! [`BackgroundCoordinator`] keeps the sensor watches, wake lock and heartbeat
//! alive for an active session, and turns shake gestures into panic and SOS
//! alerts. [`HavenCore`] wires both together from a [`HavenConfig`] and a set
//! of platform [`Capabilities`].

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod app;
pub mod capabilities;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod crypto;
pub mod gesture;
pub mod model;
pub mod offline_store;
pub mod outbox;
pub mod safe_zone;
pub mod sync;

pub use app::{CoreError, HavenCore};
pub use capabilities::Capabilities;
pub use config::{ConfigError, CoordinatorConfig, HavenConfig, StoreSettings, SyncConfig};
pub use connectivity::ConnectivityMonitor;
pub use coordinator::{BackgroundCoordinator, CoordinatorError, CoordinatorState};
pub use model::{
    ActionId, ActionKind, ActionPayload, ChatMessage, ChildCode, LatLon, LocationSample,
    ModelError, MotionSample, QueuedAction, SosAlert, SosTrigger, UnixTimeMs,
};
pub use safe_zone::{SafeZone, ZoneTransition};
pub use sync::{
    DrainOutcome, DrainReport, DualWriteReport, MetricsSnapshot, SubmitOutcome, SyncEngine,
    SyncError, SyncStatus,
};
