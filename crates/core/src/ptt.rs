//! PTT (Push-To-Talk) state machine
//!
//! Owns the transmitter keyed/unkeyed decision:
//! - Pre-key look-ahead before the hardware key goes down
//! - Tail (hang) time measured from the last activity
//! - Minimum key-down so short kerchunks still produce a clean carrier
//! - Hard timeout that always unkeys and is never extended
//!
//! Exactly one hardware effect is emitted per crossing of the
//! Unkeyed/Keyed boundary. The controller never talks to hardware itself;
//! callers act on the returned [`PttEffect`].

use std::time::Duration;

/// PTT state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PttState {
    /// Transmitter off
    Unkeyed,
    /// Key requested, waiting out the look-ahead
    PreKeying,
    /// Transmitter on
    Keyed,
    /// Transmitter on, tail timer running
    Releasing,
}

impl PttState {
    /// Whether the hardware key is down.
    #[inline]
    pub fn is_on_air(self) -> bool {
        matches!(self, PttState::Keyed | PttState::Releasing)
    }
}

/// Hardware effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PttEffect {
    KeyOn,
    KeyOff,
    /// Key off forced by the hard timeout.
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct PttTiming {
    pub pre_key: Duration,
    pub tail: Duration,
    pub min_key: Duration,
    pub timeout: Duration,
}

/// PTT controller
pub struct PttController {
    state: PttState,
    timing: PttTiming,
    /// Start of the current pre-key look-ahead
    pre_key_since: Duration,
    /// When the hardware key went down
    key_down_at: Duration,
    /// Last time something worth transmitting was seen
    last_activity: Duration,
}

impl PttController {
    pub fn new(timing: PttTiming) -> Self {
        Self {
            state: PttState::Unkeyed,
            timing,
            pre_key_since: Duration::ZERO,
            key_down_at: Duration::ZERO,
            last_activity: Duration::ZERO,
        }
    }

    #[inline]
    pub fn state(&self) -> PttState {
        self.state
    }

    #[inline]
    pub fn is_on_air(&self) -> bool {
        self.state.is_on_air()
    }

    /// Key-down timestamp of the current transmission, if on air.
    pub fn key_down_at(&self) -> Option<Duration> {
        self.is_on_air().then_some(self.key_down_at)
    }

    /// Update timing (takes effect on the next tick).
    pub fn set_timing(&mut self, timing: PttTiming) {
        self.timing = timing;
    }

    /// Request the transmitter.
    ///
    /// From Unkeyed this starts the look-ahead; from Releasing it cancels
    /// the pending unkey. Never emits a hardware effect by itself.
    pub fn begin_key(&mut self, now: Duration) {
        self.last_activity = now;
        match self.state {
            PttState::Unkeyed => {
                self.state = PttState::PreKeying;
                self.pre_key_since = now;
            }
            PttState::Releasing => {
                self.state = PttState::Keyed;
            }
            PttState::PreKeying | PttState::Keyed => {}
        }
    }

    /// Activity ended: cancel a pending pre-key, or start the tail.
    pub fn release(&mut self, now: Duration) {
        match self.state {
            PttState::PreKeying => {
                self.state = PttState::Unkeyed;
            }
            PttState::Keyed => {
                self.state = PttState::Releasing;
                self.last_activity = now;
            }
            PttState::Unkeyed | PttState::Releasing => {}
        }
    }

    /// Refreshes the tail timer (e.g. while playing generated audio).
    #[inline]
    pub fn note_activity(&mut self, now: Duration) {
        self.last_activity = now;
    }

    /// Advance timers. Returns at most one hardware effect.
    pub fn tick(&mut self, now: Duration) -> Option<PttEffect> {
        match self.state {
            PttState::Unkeyed => None,
            PttState::PreKeying => {
                if now.saturating_sub(self.pre_key_since) >= self.timing.pre_key {
                    self.state = PttState::Keyed;
                    self.key_down_at = now;
                    self.last_activity = now;
                    Some(PttEffect::KeyOn)
                } else {
                    None
                }
            }
            PttState::Keyed | PttState::Releasing => {
                let keyed_for = now.saturating_sub(self.key_down_at);
                if keyed_for >= self.timing.timeout {
                    self.state = PttState::Unkeyed;
                    return Some(PttEffect::TimedOut);
                }
                if self.state == PttState::Releasing
                    && now.saturating_sub(self.last_activity) >= self.timing.tail
                    && keyed_for >= self.timing.min_key
                {
                    self.state = PttState::Unkeyed;
                    return Some(PttEffect::KeyOff);
                }
                None
            }
        }
    }

    /// Force the transmitter off regardless of state. Idempotent.
    pub fn force_unkey(&mut self) -> Option<PttEffect> {
        let was_on_air = self.is_on_air();
        self.state = PttState::Unkeyed;
        was_on_air.then_some(PttEffect::KeyOff)
    }
}
