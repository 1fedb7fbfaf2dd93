//! Capture debouncing over the per-frame face-presence signal.
//!
//! A capture fires once a face has been continuously present for
//! `stable_duration` and at least `cooldown` has passed since the previous
//! capture. Any frame without a face restarts the stability window.

use crate::types::PresenceSample;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct DebounceConfig {
    pub stable_duration: Duration,
    pub cooldown: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            stable_duration: Duration::from_secs(3),
            cooldown: Duration::from_secs(8),
        }
    }
}

/// What the debouncer made of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No face is being tracked.
    Idle,
    /// A face is tracked but no capture is due yet.
    Pending,
    /// Capture this frame.
    Capture,
}

/// Logical debouncer state, derived from its timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Pending { since: Instant },
    /// Nothing tracked, last capture still inside the cooldown window.
    Cooling { until: Instant },
}

#[derive(Debug, Clone)]
pub struct CaptureDebouncer {
    cfg: DebounceConfig,
    first_detected_at: Option<Instant>,
    last_captured_at: Option<Instant>,
}

impl CaptureDebouncer {
    pub fn new(cfg: DebounceConfig) -> Self {
        Self {
            cfg,
            first_detected_at: None,
            last_captured_at: None,
        }
    }

    /// Feed one presence sample.
    pub fn observe(&mut self, sample: PresenceSample) -> Decision {
        let now = sample.at;

        if !sample.has_face {
            self.first_detected_at = None;
            return Decision::Idle;
        }

        let first = *self.first_detected_at.get_or_insert(now);
        let stable = now.saturating_duration_since(first) >= self.cfg.stable_duration;
        let cooled = self
            .last_captured_at
            .map_or(true, |last| now.saturating_duration_since(last) >= self.cfg.cooldown);

        if stable && cooled {
            tracing::debug!(
                held_ms = now.saturating_duration_since(first).as_millis() as u64,
                "face stable; capture due"
            );
            self.last_captured_at = Some(now);
            self.first_detected_at = None;
            Decision::Capture
        } else {
            Decision::Pending
        }
    }

    /// Current state as of `now`.
    pub fn state(&self, now: Instant) -> DebounceState {
        if let Some(since) = self.first_detected_at {
            return DebounceState::Pending { since };
        }
        match self.last_captured_at {
            Some(last) if now.saturating_duration_since(last) < self.cfg.cooldown => {
                DebounceState::Cooling { until: last + self.cfg.cooldown }
            }
            _ => DebounceState::Idle,
        }
    }

    #[cfg(test)]
    pub fn last_captured_at(&self) -> Option<Instant> {
        self.last_captured_at
    }
}

impl Default for CaptureDebouncer {
    fn default() -> Self {
        Self::new(DebounceConfig::default())
    }
}
