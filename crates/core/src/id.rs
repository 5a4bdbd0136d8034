//! Station identification schedule.

use std::time::Duration;

pub struct IdScheduler {
    interval: Duration,
    enabled: bool,
    last_id: Duration,
    requested: bool,
}

impl IdScheduler {
    /// The session start counts as the first identification.
    pub fn new(interval: Duration, enabled: bool) -> Self {
        Self {
            interval,
            enabled,
            last_id: Duration::ZERO,
            requested: false,
        }
    }

    pub fn configure(&mut self, interval: Duration, enabled: bool) {
        self.interval = interval;
        self.enabled = enabled;
    }

    pub fn is_due(&self, now: Duration) -> bool {
        self.requested || (self.enabled && now.saturating_sub(self.last_id) >= self.interval)
    }

    /// Whether an operator asked for an ID out of schedule.
    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn request_now(&mut self) {
        self.requested = true;
    }

    /// Records a completed identification. `now` is the playback completion
    /// time, so a late ID does not shorten the next interval.
    pub fn mark_identified(&mut self, now: Duration) {
        self.last_id = now;
        self.requested = false;
    }

    pub fn last_identified(&self) -> Duration {
        self.last_id
    }
}
