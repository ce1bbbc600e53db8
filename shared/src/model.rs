//! Domain values shared by the queue, the engine and the coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("invalid child code: {0}")]
    InvalidChildCode(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn millis_since(self, earlier: UnixTimeMs) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queued action identifier - immutable after construction
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(String);

impl ActionId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, ModelError> {
        let id = id.into().trim().to_string();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// `<unix-ms>-<12 hex chars>`; sorts roughly by creation time.
    pub fn generate(now: UnixTimeMs) -> Self {
        let entropy = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", now.0, &entropy[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), ModelError> {
        if id.is_empty() {
            return Err(ModelError::InvalidId("ActionId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(ModelError::InvalidId(format!(
                "ActionId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ModelError::InvalidId(
                "ActionId contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pairing code identifying a child device. Used verbatim as a remote path
/// segment, so the realtime tree's reserved characters are rejected.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildCode(String);

impl ChildCode {
    const MAX_LENGTH: usize = 64;
    const RESERVED: [char; 6] = ['/', '.', '#', '$', '[', ']'];

    pub fn new(code: impl Into<String>) -> Result<Self, ModelError> {
        let code = code.into().trim().to_string();
        if code.is_empty() {
            return Err(ModelError::InvalidChildCode("code cannot be empty".into()));
        }
        if code.len() > Self::MAX_LENGTH {
            return Err(ModelError::InvalidChildCode(format!(
                "code exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if code
            .chars()
            .any(|c| c.is_control() || c.is_whitespace() || Self::RESERVED.contains(&c))
        {
            return Err(ModelError::InvalidChildCode(format!(
                "code {code:?} contains reserved characters"
            )));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChildCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated geographic coordinates
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    lat: f64,
    lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Result<Self, ModelError> {
        if lat.is_nan() || lon.is_nan() {
            return Err(ModelError::Validation("coordinates cannot be NaN".into()));
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(ModelError::Validation(format!(
                "latitude must be between -90 and 90, got {lat}"
            )));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(ModelError::Validation(format!(
                "longitude must be between -180 and 180, got {lon}"
            )));
        }
        Ok(Self { lat, lon })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub position: LatLon,
    pub accuracy_m: f64,
    pub timestamp: UnixTimeMs,
    /// Battery level in percent, when the platform reports it.
    pub battery: Option<u8>,
}

impl LocationSample {
    pub fn new(position: LatLon, accuracy_m: f64, timestamp: UnixTimeMs) -> Self {
        Self {
            position,
            accuracy_m,
            timestamp,
            battery: None,
        }
    }

    pub fn with_battery(mut self, percent: u8) -> Self {
        self.battery = Some(percent.min(100));
        self
    }
}

/// Raw accelerometer reading including gravity, in m/s^2.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub timestamp: UnixTimeMs,
}

impl MotionSample {
    pub fn new(x: f64, y: f64, z: f64, timestamp: UnixTimeMs) -> Self {
        Self { x, y, z, timestamp }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
    pub sent_at: UnixTimeMs,
}

impl ChatMessage {
    pub const MAX_TEXT_LENGTH: usize = 4_000;

    pub fn new(
        sender: impl Into<String>,
        text: impl Into<String>,
        sent_at: UnixTimeMs,
    ) -> Result<Self, ModelError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ModelError::Validation("message text cannot be empty".into()));
        }
        if text.len() > Self::MAX_TEXT_LENGTH {
            return Err(ModelError::Validation(format!(
                "message text exceeds {} bytes",
                Self::MAX_TEXT_LENGTH
            )));
        }
        Ok(Self {
            sender: sender.into(),
            text,
            sent_at,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SosTrigger {
    Manual,
    Gesture,
    Voice,
}

impl SosTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            SosTrigger::Manual => "manual",
            SosTrigger::Gesture => "gesture",
            SosTrigger::Voice => "voice",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SosAlert {
    /// Last known position, if any fix has been seen yet.
    pub position: Option<LatLon>,
    pub raised_at: UnixTimeMs,
    pub trigger: SosTrigger,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Location,
    Message,
    SosAlert,
    StatusChange,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Location => "location",
            ActionKind::Message => "message",
            ActionKind::SosAlert => "sos_alert",
            ActionKind::StatusChange => "status_change",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionPayload {
    Location {
        child: ChildCode,
        sample: LocationSample,
    },
    Message {
        child: ChildCode,
        message: ChatMessage,
    },
    SosAlert {
        child: ChildCode,
        alert: SosAlert,
    },
    StatusChange {
        child: ChildCode,
        status: String,
    },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::Location { .. } => ActionKind::Location,
            ActionPayload::Message { .. } => ActionKind::Message,
            ActionPayload::SosAlert { .. } => ActionKind::SosAlert,
            ActionPayload::StatusChange { .. } => ActionKind::StatusChange,
        }
    }

    pub fn child(&self) -> &ChildCode {
        match self {
            ActionPayload::Location { child, .. }
            | ActionPayload::Message { child, .. }
            | ActionPayload::SosAlert { child, .. }
            | ActionPayload::StatusChange { child, .. } => child,
        }
    }
}

/// A mutation waiting for delivery to the remote store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: ActionId,
    pub payload: ActionPayload,
    pub enqueued_at: UnixTimeMs,
    pub retry_count: u32,
}

impl QueuedAction {
    pub fn new(payload: ActionPayload, now: UnixTimeMs) -> Self {
        Self::with_id(ActionId::generate(now), payload, now)
    }

    pub fn with_id(id: ActionId, payload: ActionPayload, now: UnixTimeMs) -> Self {
        Self {
            id,
            payload,
            enqueued_at: now,
            retry_count: 0,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }
}
