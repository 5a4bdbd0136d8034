//! Voice-operated switch with attack/release hysteresis.
//!
//! Loudness is smoothed with time-proportional coefficients so behaviour does
//! not depend on the tick rate. `active` only flips after the comparison has
//! disagreed with it continuously for the full attack (to assert) or release
//! (to clear) duration.

use std::time::Duration;

/// Smoothing time constant as a fraction of the attack/release duration.
const SMOOTHING_DIVISOR: f32 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxTransition {
    Activated,
    Released,
}

pub struct VoxDetector {
    threshold: f32,
    attack: Duration,
    release: Duration,
    smoothed: f32,
    active: bool,
    pending: Duration,
}

impl VoxDetector {
    /// `threshold` is expected to be clamped already (see `RepeaterConfig::normalized`).
    pub fn new(threshold: f32, attack: Duration, release: Duration) -> Self {
        Self {
            threshold,
            attack,
            release,
            smoothed: 0.0,
            active: false,
            pending: Duration::ZERO,
        }
    }

    pub fn configure(&mut self, threshold: f32, attack: Duration, release: Duration) {
        self.threshold = threshold;
        self.attack = attack;
        self.release = release;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn smoothed_level(&self) -> f32 {
        self.smoothed
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Feeds one loudness reading covering `dt` of audio.
    pub fn update(&mut self, level: f32, dt: Duration) -> Option<VoxTransition> {
        let tau = if level > self.smoothed {
            self.attack.as_secs_f32() / SMOOTHING_DIVISOR
        } else {
            self.release.as_secs_f32() / SMOOTHING_DIVISOR
        };
        let coeff = if tau > 0.0 {
            1.0 - (-dt.as_secs_f32() / tau).exp()
        } else {
            1.0
        };
        self.smoothed += (level - self.smoothed) * coeff;

        let above = level > self.threshold && self.smoothed > self.threshold;
        let below = level <= self.threshold && self.smoothed <= self.threshold;
        let disagrees = if self.active { below } else { above };

        if !disagrees {
            self.pending = Duration::ZERO;
            return None;
        }

        self.pending += dt;
        let needed = if self.active { self.release } else { self.attack };
        if self.pending < needed {
            return None;
        }

        self.pending = Duration::ZERO;
        self.active = !self.active;
        Some(if self.active {
            VoxTransition::Activated
        } else {
            VoxTransition::Released
        })
    }

    /// Drops to inactive without reporting a transition.
    pub fn force_inactive(&mut self) {
        self.active = false;
        self.pending = Duration::ZERO;
        self.smoothed = 0.0;
    }

    pub fn reset(&mut self) {
        self.force_inactive();
    }
}
