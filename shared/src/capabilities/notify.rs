//! User-facing signal seam: toasts, sounds and system notifications.
//!
//! The core only emits machine-readable codes; wording and localisation are
//! the shell's job.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoundKind {
    Alarm,
    Siren,
    Chime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeCode {
    SyncCompleted,
    ActionQueued,
    ActionDropped,
    ConnectivityLost,
    ConnectivityRestored,
    DegradedMode,
    LocationPermissionDenied,
    MotionUnavailable,
    SafeZoneExited,
    SafeZoneEntered,
    PanicGesture,
    SosRaised,
    Heartbeat,
}

impl NoticeCode {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            NoticeCode::SyncCompleted => "sync_completed",
            NoticeCode::ActionQueued => "action_queued",
            NoticeCode::ActionDropped => "action_dropped",
            NoticeCode::ConnectivityLost => "connectivity_lost",
            NoticeCode::ConnectivityRestored => "connectivity_restored",
            NoticeCode::DegradedMode => "degraded_mode",
            NoticeCode::LocationPermissionDenied => "location_permission_denied",
            NoticeCode::MotionUnavailable => "motion_unavailable",
            NoticeCode::SafeZoneExited => "safe_zone_exited",
            NoticeCode::SafeZoneEntered => "safe_zone_entered",
            NoticeCode::PanicGesture => "panic_gesture",
            NoticeCode::SosRaised => "sos_raised",
            NoticeCode::Heartbeat => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub code: NoticeCode,
    pub severity: Severity,
    pub context: BTreeMap<&'static str, String>,
}

impl Notice {
    pub fn new(code: NoticeCode, severity: Severity) -> Self {
        Self {
            code,
            severity,
            context: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.insert(key, value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }
}

/// Implementations must not block and must not panic; calls come from
/// timers and sensor callbacks.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &Notice);
    fn play_sound(&self, sound: SoundKind);
    fn show_system_notification(&self, title: &str, body: &str);
}

/// Routes everything into `tracing`. Default for headless hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: &Notice) {
        let code = notice.code.code();
        let context = &notice.context;
        match notice.severity {
            Severity::Debug => debug!(code, ?context, "notice"),
            Severity::Info => info!(code, ?context, "notice"),
            Severity::Warning => warn!(code, ?context, "notice"),
            Severity::Critical => error!(code, ?context, "notice"),
        }
    }

    fn play_sound(&self, sound: SoundKind) {
        info!(?sound, "sound requested");
    }

    fn show_system_notification(&self, title: &str, body: &str) {
        info!(title, body, "system notification requested");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellSignal {
    Notice(Notice),
    Sound(SoundKind),
    SystemNotification { title: String, body: String },
}

/// Buffers signals for shells that poll the core instead of receiving
/// callbacks. Oldest signals are dropped past `capacity`.
#[derive(Debug)]
pub struct QueuedNotifier {
    signals: Mutex<VecDeque<ShellSignal>>,
    capacity: usize,
}

impl Default for QueuedNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl QueuedNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            signals: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn signals(&self) -> MutexGuard<'_, VecDeque<ShellSignal>> {
        self.signals
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn push(&self, signal: ShellSignal) {
        let mut signals = self.signals();
        if signals.len() >= self.capacity {
            signals.pop_front();
        }
        signals.push_back(signal);
    }

    /// Takes every buffered signal, oldest first.
    pub fn drain(&self) -> Vec<ShellSignal> {
        self.signals().drain(..).collect()
    }

    /// Non-destructive view of buffered notices with `code`.
    pub fn notices(&self, code: NoticeCode) -> Vec<Notice> {
        self.signals()
            .iter()
            .filter_map(|s| match s {
                ShellSignal::Notice(n) if n.code == code => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sounds(&self) -> Vec<SoundKind> {
        self.signals()
            .iter()
            .filter_map(|s| match s {
                ShellSignal::Sound(k) => Some(*k),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.signals().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Notifier for QueuedNotifier {
    fn notify(&self, notice: &Notice) {
        self.push(ShellSignal::Notice(notice.clone()));
    }

    fn play_sound(&self, sound: SoundKind) {
        self.push(ShellSignal::Sound(sound));
    }

    fn show_system_notification(&self, title: &str, body: &str) {
        self.push(ShellSignal::SystemNotification {
            title: title.to_string(),
            body: body.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_context() {
        let n = Notice::new(NoticeCode::SyncCompleted, Severity::Info)
            .with_context("succeeded", 3)
            .with_context("dropped", 0);
        assert_eq!(n.get("succeeded"), Some("3"));
        assert_eq!(n.code.code(), "sync_completed");
    }

    #[test]
    fn queued_notifier_buffers_and_drains() {
        let q = QueuedNotifier::new(2);
        q.notify(&Notice::new(NoticeCode::Heartbeat, Severity::Debug));
        q.play_sound(SoundKind::Alarm);
        q.show_system_notification("sos_raised", "child=KID");
        assert_eq!(q.len(), 2);
        assert_eq!(q.sounds(), vec![SoundKind::Alarm]);

        let drained = q.drain();
        assert!(matches!(drained[1], ShellSignal::SystemNotification { .. }));
        assert!(q.is_empty());
    }

    #[test]
    fn severity_orders() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Debug < Severity::Info);
    }
}
