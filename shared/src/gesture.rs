//! Shake gesture detection over raw accelerometer samples.

use serde::{Deserialize, Serialize};

use crate::model::{MotionSample, UnixTimeMs};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShakeConfig {
    /// Minimum |dx|+|dy|+|dz| between consecutive samples.
    pub threshold: f64,
    pub debounce_ms: u64,
    pub window_ms: u64,
    pub panic_count: u32,
    pub sos_count: u32,
}

impl Default for ShakeConfig {
    fn default() -> Self {
        Self {
            threshold: 15.0,
            debounce_ms: 500,
            window_ms: 3_000,
            panic_count: 3,
            sos_count: 4,
        }
    }
}

impl ShakeConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err("shake threshold must be a positive number".into());
        }
        if self.window_ms <= self.debounce_ms {
            return Err("shake window must be longer than the debounce interval".into());
        }
        if self.panic_count == 0 || self.sos_count <= self.panic_count {
            return Err("sos_count must be greater than panic_count, which must be non-zero".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureEvent {
    Panic,
    Sos,
}

#[derive(Debug, Clone)]
pub struct ShakeDetector {
    config: ShakeConfig,
    previous: (f64, f64, f64),
    shake_count: u32,
    last_shake_at: Option<UnixTimeMs>,
}

impl Default for ShakeDetector {
    fn default() -> Self {
        Self::new(ShakeConfig::default())
    }
}

impl ShakeDetector {
    pub fn new(config: ShakeConfig) -> Self {
        Self {
            config,
            previous: (0.0, 0.0, 0.0),
            shake_count: 0,
            last_shake_at: None,
        }
    }

    pub fn shake_count(&self) -> u32 {
        self.shake_count
    }

    /// Zeroes the count once `window_ms` has passed since the last counted
    /// shake.
    pub fn expire(&mut self, now: UnixTimeMs) {
        if let Some(last) = self.last_shake_at {
            if now.millis_since(last) >= self.config.window_ms {
                self.shake_count = 0;
                self.last_shake_at = None;
            }
        }
    }

    pub fn observe(&mut self, sample: &MotionSample) -> Option<GestureEvent> {
        self.expire(sample.timestamp);
        if !(sample.x.is_finite() && sample.y.is_finite() && sample.z.is_finite()) {
            return None;
        }

        let (px, py, pz) = self.previous;
        let delta = (sample.x - px).abs() + (sample.y - py).abs() + (sample.z - pz).abs();
        self.previous = (sample.x, sample.y, sample.z);

        if delta <= self.config.threshold {
            return None;
        }
        if let Some(last) = self.last_shake_at {
            if sample.timestamp.millis_since(last) < self.config.debounce_ms {
                return None;
            }
        }

        self.shake_count += 1;
        self.last_shake_at = Some(sample.timestamp);

        if self.shake_count >= self.config.sos_count {
            self.shake_count = 0;
            self.last_shake_at = None;
            return Some(GestureEvent::Sos);
        }
        if self.shake_count == self.config.panic_count {
            return Some(GestureEvent::Panic);
        }
        None
    }
}
