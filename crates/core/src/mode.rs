//! Mode strategies.
//!
//! The repeater state machine is the same in every mode; a strategy decides
//! what starts and ends an activity, what audio leaves the core while the
//! channel is active and what gets queued when activity ends.

use crate::config::{RepeaterConfig, RepeaterMode};
use crate::constants::{samples_for, FRAME_SIZE, SAMPLE_RATE};
use crate::delay::DelayLine;
use std::collections::VecDeque;
use std::time::Duration;

/// Per-frame view of the state machine handed to a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    /// The state machine is in Active.
    pub active: bool,
    /// The transmitter is up.
    pub on_air: bool,
}

pub trait ModeStrategy: Send {
    fn mode(&self) -> RepeaterMode;

    /// Whether VOX drives Idle -> Active and Active -> CourtesyPending.
    fn vox_triggered(&self) -> bool {
        true
    }

    /// Whether `Control::ManualStart` / `ManualStop` apply.
    fn accepts_manual(&self) -> bool {
        false
    }

    /// Whether entering Active requests the transmitter straight away.
    fn keys_while_active(&self) -> bool;

    /// Whether DTMF commands are interpreted in this mode.
    fn accepts_commands(&self) -> bool {
        false
    }

    /// Applies a new session config (mode unchanged).
    fn reconfigure(&mut self, config: &RepeaterConfig);

    /// Idle -> Active.
    fn begin_activity(&mut self) {}

    /// Feeds one input frame. Returns true when `output` was written with
    /// audio to transmit.
    fn process(&mut self, input: &[f32], output: &mut [f32], ctx: FrameContext) -> bool;

    /// Set when the activity must end regardless of VOX.
    fn limit_reached(&self) -> bool {
        false
    }

    /// Active -> CourtesyPending. Appends end-of-activity audio to `playback`
    /// and returns how much was queued.
    fn end_activity(&mut self, playback: &mut VecDeque<f32>) -> Duration;

    /// Drops everything in flight (timeout, fault, shutdown).
    fn reset(&mut self);
}

pub fn strategy_for(config: &RepeaterConfig) -> Box<dyn ModeStrategy> {
    match config.mode {
        RepeaterMode::FullRepeater => Box::new(FullRepeater::new(config)),
        RepeaterMode::ContinuousDelayLine => Box::new(ContinuousDelay::new(config)),
        RepeaterMode::TimedAutoReplay => Box::new(TimedReplay::new(config)),
        RepeaterMode::Manual => Box::new(ManualReplay::new(config)),
    }
}

fn samples_to_duration(samples: usize) -> Duration {
    Duration::from_nanos(samples as u64 * 1_000_000_000 / SAMPLE_RATE as u64)
}

/// Audio that may precede the VOX decision: the attack time plus the same
/// again for the smoothed level to cross the threshold on a weak signal.
pub fn vox_look_behind(config: &RepeaterConfig) -> Duration {
    config.attack() * 2
}

// ── Shared helpers ──────────────────────────────────────────────────────────

/// Live retransmission through a delay line.
struct Relay {
    line: DelayLine,
}

impl Relay {
    fn new(delay: Duration) -> Self {
        Self {
            line: DelayLine::new(samples_for(delay)),
        }
    }

    fn resize(&mut self, delay: Duration) {
        self.line.resize(samples_for(delay));
    }

    fn process(&mut self, input: &[f32], output: &mut [f32], ctx: FrameContext) -> bool {
        self.line.process(input, output);
        ctx.active && ctx.on_air
    }

    fn flush(&mut self, playback: &mut VecDeque<f32>) -> Duration {
        let before = playback.len();
        self.line.flush_into(playback);
        samples_to_duration(playback.len() - before)
    }

    fn reset(&mut self) {
        self.line.reset();
    }
}

/// Recording with an optional pre-roll and a length cap.
struct Recorder {
    pre_roll: DelayLine,
    recording: Vec<f32>,
    active: bool,
    max_samples: usize,
    scratch: Vec<f32>,
}

impl Recorder {
    fn new(pre_roll: Duration, max_record: Duration) -> Self {
        let max_samples = samples_for(max_record);
        Self {
            pre_roll: DelayLine::new(samples_for(pre_roll)),
            recording: Vec::with_capacity(max_samples),
            active: false,
            max_samples,
            scratch: vec![0.0; FRAME_SIZE],
        }
    }

    fn reconfigure(&mut self, pre_roll: Duration, max_record: Duration) {
        self.pre_roll.resize(samples_for(pre_roll));
        self.max_samples = samples_for(max_record);
    }

    fn begin(&mut self) {
        self.recording.clear();
        self.pre_roll
            .copy_recent(self.pre_roll.delay(), &mut self.recording);
        self.recording.truncate(self.max_samples);
        self.active = true;
    }

    fn process(&mut self, input: &[f32], ctx: FrameContext) {
        if self.scratch.len() != input.len() {
            self.scratch.resize(input.len(), 0.0);
        }
        self.pre_roll.process(input, &mut self.scratch);
        if ctx.active && self.active {
            let room = self.max_samples.saturating_sub(self.recording.len());
            self.recording
                .extend_from_slice(&input[..input.len().min(room)]);
        }
    }

    fn limit_reached(&self) -> bool {
        self.active && self.recording.len() >= self.max_samples
    }

    fn recorded(&self) -> Duration {
        samples_to_duration(self.recording.len())
    }

    fn finish(&mut self, playback: &mut VecDeque<f32>) -> Duration {
        self.active = false;
        let recorded = self.recorded();
        playback.extend(self.recording.drain(..));
        recorded
    }

    fn reset(&mut self) {
        self.recording.clear();
        self.active = false;
        self.pre_roll.reset();
    }
}

// ── Full repeater ───────────────────────────────────────────────────────────

/// Live repeat with courtesy tone, auto-ID and DTMF commands.
///
/// The look-ahead covers the VOX decision plus the pre-key, so the audio
/// that tripped the VOX is still in the line when the transmitter comes up.
pub struct FullRepeater {
    relay: Relay,
}

impl FullRepeater {
    pub fn new(config: &RepeaterConfig) -> Self {
        Self {
            relay: Relay::new(Self::look_ahead(config)),
        }
    }

    pub fn look_ahead(config: &RepeaterConfig) -> Duration {
        vox_look_behind(config) + config.pre_key()
    }
}

impl ModeStrategy for FullRepeater {
    fn mode(&self) -> RepeaterMode {
        RepeaterMode::FullRepeater
    }

    fn keys_while_active(&self) -> bool {
        true
    }

    fn accepts_commands(&self) -> bool {
        true
    }

    fn reconfigure(&mut self, config: &RepeaterConfig) {
        self.relay.resize(Self::look_ahead(config));
    }

    fn process(&mut self, input: &[f32], output: &mut [f32], ctx: FrameContext) -> bool {
        self.relay.process(input, output, ctx)
    }

    fn end_activity(&mut self, playback: &mut VecDeque<f32>) -> Duration {
        self.relay.flush(playback)
    }

    fn reset(&mut self) {
        self.relay.reset();
    }
}

// ── Continuous delay line ───────────────────────────────────────────────────

/// Everything heard is retransmitted after the configured fixed delay.
pub struct ContinuousDelay {
    relay: Relay,
}

impl ContinuousDelay {
    pub fn new(config: &RepeaterConfig) -> Self {
        Self {
            relay: Relay::new(config.delay()),
        }
    }
}

impl ModeStrategy for ContinuousDelay {
    fn mode(&self) -> RepeaterMode {
        RepeaterMode::ContinuousDelayLine
    }

    fn keys_while_active(&self) -> bool {
        true
    }

    fn reconfigure(&mut self, config: &RepeaterConfig) {
        self.relay.resize(config.delay());
    }

    fn process(&mut self, input: &[f32], output: &mut [f32], ctx: FrameContext) -> bool {
        self.relay.process(input, output, ctx)
    }

    fn end_activity(&mut self, playback: &mut VecDeque<f32>) -> Duration {
        self.relay.flush(playback)
    }

    fn reset(&mut self) {
        self.relay.reset();
    }
}

// ── Timed auto replay ───────────────────────────────────────────────────────

/// VOX-triggered record, then a single replay ("parrot").
///
/// Keeps a pre-roll so the start of the message is not lost to the VOX
/// decision.
pub struct TimedReplay {
    recorder: Recorder,
}

impl TimedReplay {
    pub fn new(config: &RepeaterConfig) -> Self {
        Self {
            recorder: Recorder::new(vox_look_behind(config), config.max_record()),
        }
    }

    pub fn recorded(&self) -> Duration {
        self.recorder.recorded()
    }
}

impl ModeStrategy for TimedReplay {
    fn mode(&self) -> RepeaterMode {
        RepeaterMode::TimedAutoReplay
    }

    fn keys_while_active(&self) -> bool {
        false
    }

    fn reconfigure(&mut self, config: &RepeaterConfig) {
        self.recorder
            .reconfigure(vox_look_behind(config), config.max_record());
    }

    fn begin_activity(&mut self) {
        self.recorder.begin();
    }

    fn process(&mut self, input: &[f32], _output: &mut [f32], ctx: FrameContext) -> bool {
        self.recorder.process(input, ctx);
        false
    }

    fn limit_reached(&self) -> bool {
        self.recorder.limit_reached()
    }

    fn end_activity(&mut self, playback: &mut VecDeque<f32>) -> Duration {
        self.recorder.finish(playback)
    }

    fn reset(&mut self) {
        self.recorder.reset();
    }
}

// ── Manual ──────────────────────────────────────────────────────────────────

/// Operator starts and stops recordings; each is replayed once.
pub struct ManualReplay {
    recorder: Recorder,
}

impl ManualReplay {
    pub fn new(config: &RepeaterConfig) -> Self {
        Self {
            recorder: Recorder::new(Duration::ZERO, config.max_record()),
        }
    }

    pub fn recorded(&self) -> Duration {
        self.recorder.recorded()
    }
}

impl ModeStrategy for ManualReplay {
    fn mode(&self) -> RepeaterMode {
        RepeaterMode::Manual
    }

    fn vox_triggered(&self) -> bool {
        false
    }

    fn accepts_manual(&self) -> bool {
        true
    }

    fn keys_while_active(&self) -> bool {
        false
    }

    fn reconfigure(&mut self, config: &RepeaterConfig) {
        self.recorder.reconfigure(Duration::ZERO, config.max_record());
    }

    fn begin_activity(&mut self) {
        self.recorder.begin();
    }

    fn process(&mut self, input: &[f32], _output: &mut [f32], ctx: FrameContext) -> bool {
        self.recorder.process(input, ctx);
        false
    }

    fn limit_reached(&self) -> bool {
        self.recorder.limit_reached()
    }

    fn end_activity(&mut self, playback: &mut VecDeque<f32>) -> Duration {
        self.recorder.finish(playback)
    }

    fn reset(&mut self) {
        self.recorder.reset();
    }
}
