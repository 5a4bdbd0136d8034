//! Repeater state machine.
//!
//! `RepeaterCore` is owned by the processing thread and driven one frame at a
//! time through [`RepeaterCore::process_frame`]. Everything it needs from the
//! outside world arrives over bounded channels drained at the start of each
//! frame; everything it tells the outside world leaves through `try_send`.
//! Nothing in the per-frame path blocks, locks or performs I/O apart from the
//! `KeyLine` call on a keying transition.

use crate::command::{ClearReason, CommandAssembler, CommandOutcome, CommandSnapshot};
use crate::config::RepeaterConfig;
use crate::constants::{FRAME_DURATION, FRAME_SIZE};
use crate::dtmf::{DtmfDecoder, DtmfKey};
use crate::id::IdScheduler;
use crate::level::{apply_gain, loudness};
use crate::mode::{strategy_for, FrameContext, ModeStrategy};
use crate::ptt::{PttController, PttEffect, PttState, PttTiming};
use crate::tone::{courtesy_tone, lead_in_tone};
use crate::vox::{VoxDetector, VoxTransition};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const EVENT_QUEUE: usize = 256;
const ANNOUNCEMENT_QUEUE: usize = 16;
const CONTROL_QUEUE: usize = 32;
const RECORDING_QUEUE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeaterState {
    Idle,
    Active,
    CourtesyPending,
    IdPending,
    /// Playing a command response or requested ID outside a transmission.
    Announcing,
    /// Locked out after a hard timeout until the channel clears.
    Timeout,
}

impl RepeaterState {
    const ALL: [RepeaterState; 6] = [
        RepeaterState::Idle,
        RepeaterState::Active,
        RepeaterState::CourtesyPending,
        RepeaterState::IdPending,
        RepeaterState::Announcing,
        RepeaterState::Timeout,
    ];

    fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(RepeaterState::Idle)
    }
}

impl fmt::Display for RepeaterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepeaterState::Idle => "idle",
            RepeaterState::Active => "active",
            RepeaterState::CourtesyPending => "courtesy",
            RepeaterState::IdPending => "id",
            RepeaterState::Announcing => "announcing",
            RepeaterState::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnouncementKind {
    Identification,
    CommandResponse(String),
}

/// Outbound request for rendered audio, answered by an [`AnnouncementReady`]
/// carrying the same token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncementRequest {
    pub token: u64,
    pub kind: AnnouncementKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnouncementReady {
    pub token: u64,
    /// Mono samples at `SAMPLE_RATE`.
    pub audio: Vec<f32>,
}

/// Messages applied between frames.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    /// Start a recording (Manual mode only).
    ManualStart,
    /// Finish the recording and replay it (Manual mode only).
    ManualStop,
    /// Identify at the next opportunity.
    Identify,
    /// Replace the session config. A mode change is refused.
    Reconfigure(Box<RepeaterConfig>),
    /// The keying hardware failed asynchronously.
    KeyingFault(String),
    /// Unkey and stop processing.
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RepeaterEvent {
    StateChanged {
        from: RepeaterState,
        to: RepeaterState,
    },
    Keyed,
    /// Normal end of transmission.
    Unkeyed,
    VoxChanged(bool),
    DigitDetected {
        key: DtmfKey,
        accepted: bool,
    },
    CommandDispatched(String),
    CommandCleared(ClearReason),
    CommandRejected(ClearReason),
    RecordingStarted,
    RecordingFinished(Duration),
    Identified,
    /// The hard timeout unkeyed the transmitter.
    Timeout,
    KeyingFault(String),
    AnnouncementDropped(u64),
}

/// Hardware keying collaborator (relay, serial line, CAT command...).
pub trait KeyLine: Send {
    fn set_keyed(&mut self, keyed: bool) -> anyhow::Result<()>;
}

/// Lock-free snapshot of the core, written only by the processing thread.
#[derive(Debug, Default)]
pub struct RepeaterStatus {
    keyed: AtomicBool,
    state: AtomicU8,
    level: AtomicU32,
    vox: AtomicBool,
    command: AtomicU32,
}

impl RepeaterStatus {
    pub fn is_keyed(&self) -> bool {
        self.keyed.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RepeaterState {
        RepeaterState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Smoothed input loudness (0..1).
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    pub fn vox_active(&self) -> bool {
        self.vox.load(Ordering::Relaxed)
    }

    /// Command digits entered so far.
    pub fn command(&self) -> CommandSnapshot {
        CommandSnapshot::unpack(self.command.load(Ordering::Relaxed))
    }
}

/// The non-realtime side of the channels.
pub struct CoreHandle {
    pub events: Receiver<RepeaterEvent>,
    pub requests: Receiver<AnnouncementRequest>,
    pub ready: Sender<AnnouncementReady>,
    pub control: Sender<Control>,
    pub status: Arc<RepeaterStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Identification,
    CommandResponse,
}

struct PendingRequest {
    token: u64,
    kind: RequestKind,
    sent_at: Duration,
}

pub struct RepeaterCore {
    config: RepeaterConfig,
    state: RepeaterState,
    state_since: Duration,

    vox: VoxDetector,
    dtmf: DtmfDecoder,
    assembler: CommandAssembler,
    ptt: PttController,
    id: IdScheduler,
    strategy: Box<dyn ModeStrategy>,
    key_line: Box<dyn KeyLine>,

    // Audio
    input: Vec<f32>,
    output: Vec<f32>,
    playback: VecDeque<f32>,
    courtesy: Vec<f32>,
    lead_in: Vec<f32>,
    last_generated: Option<Duration>,
    last_now: Option<Duration>,

    // Flow
    lockout: bool,
    manual_start: bool,
    manual_stop: bool,
    playing_id: bool,
    stopped: bool,
    /// Whether the key line last accepted a key-on.
    hw_keyed: bool,

    // Announcements
    next_token: u64,
    pending: Vec<PendingRequest>,
    id_audio: Option<Vec<f32>>,
    responses: VecDeque<Vec<f32>>,

    // Channels
    events_tx: Sender<RepeaterEvent>,
    requests_tx: Sender<AnnouncementRequest>,
    ready_rx: Receiver<AnnouncementReady>,
    control_rx: Receiver<Control>,
    status: Arc<RepeaterStatus>,
    recordings_tx: Option<Sender<Vec<f32>>>,
}

fn ptt_timing(config: &RepeaterConfig) -> PttTiming {
    PttTiming {
        pre_key: config.pre_key(),
        tail: config.tail(),
        min_key: config.min_key(),
        timeout: config.timeout(),
    }
}

impl RepeaterCore {
    pub fn new(config: RepeaterConfig, key_line: Box<dyn KeyLine>) -> (Self, CoreHandle) {
        let config = config.normalized();
        let (events_tx, events_rx) = bounded(EVENT_QUEUE);
        let (requests_tx, requests_rx) = bounded(ANNOUNCEMENT_QUEUE);
        let (ready_tx, ready_rx) = bounded(ANNOUNCEMENT_QUEUE);
        let (control_tx, control_rx) = bounded(CONTROL_QUEUE);
        let status = Arc::new(RepeaterStatus::default());

        log::info!(
            "Repeater core: mode {}, threshold {:.3}, tail {}ms, timeout {}s",
            config.mode,
            config.threshold,
            config.tail_ms,
            config.timeout_ms / 1000
        );

        let core = Self {
            state: RepeaterState::Idle,
            state_since: Duration::ZERO,
            vox: VoxDetector::new(config.threshold, config.attack(), config.release()),
            dtmf: DtmfDecoder::new(&config.dtmf),
            assembler: CommandAssembler::new(Duration::from_millis(config.dtmf.digit_timeout_ms)),
            ptt: PttController::new(ptt_timing(&config)),
            id: IdScheduler::new(config.id_interval(), config.auto_id),
            strategy: strategy_for(&config),
            key_line,
            input: vec![0.0; FRAME_SIZE],
            output: vec![0.0; FRAME_SIZE],
            playback: VecDeque::new(),
            courtesy: courtesy_tone(&config.courtesy),
            lead_in: lead_in_tone(&config.lead_in),
            last_generated: None,
            last_now: None,
            lockout: false,
            manual_start: false,
            manual_stop: false,
            playing_id: false,
            stopped: false,
            hw_keyed: false,
            next_token: 1,
            pending: Vec::new(),
            id_audio: None,
            responses: VecDeque::new(),
            events_tx,
            requests_tx,
            ready_rx,
            control_rx,
            status: status.clone(),
            recordings_tx: None,
            config,
        };

        let handle = CoreHandle {
            events: events_rx,
            requests: requests_rx,
            ready: ready_tx,
            control: control_tx,
            status,
        };
        (core, handle)
    }

    pub fn state(&self) -> RepeaterState {
        self.state
    }

    pub fn ptt_state(&self) -> PttState {
        self.ptt.state()
    }

    pub fn config(&self) -> &RepeaterConfig {
        &self.config
    }

    /// Completion time of the last station identification.
    pub fn last_identified(&self) -> Duration {
        self.id.last_identified()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Subscribes to finished recordings of the record-and-replay modes.
    /// Each message is one recording as queued for replay. Only the most
    /// recent subscription receives audio.
    pub fn recordings(&mut self) -> Receiver<Vec<f32>> {
        let (tx, rx) = bounded(RECORDING_QUEUE);
        self.recordings_tx = Some(tx);
        rx
    }

    /// Processes one frame. `now` is the audio clock: time since session
    /// start of the first sample in `input`. Frames of the wrong length are
    /// treated as silence.
    pub fn process_frame(&mut self, input: &[f32], output: &mut [f32], now: Duration) {
        output.fill(0.0);
        if self.stopped {
            return;
        }
        self.drain_controls(now);
        if self.stopped {
            return;
        }
        self.drain_ready();

        let dt = self
            .last_now
            .map_or(FRAME_DURATION, |prev| now.saturating_sub(prev));
        self.last_now = Some(now);

        if input.len() == FRAME_SIZE {
            self.input.copy_from_slice(input);
            apply_gain(&mut self.input, self.config.input_gain);
        } else {
            log::trace!("Frame of {} samples treated as silence", input.len());
            self.input.fill(0.0);
        }

        // Detection
        let holdoff = self.in_holdoff(now);
        let level = if holdoff { 0.0 } else { loudness(&self.input, 1.0) };
        if let Some(transition) = self.vox.update(level, dt) {
            let active = transition == VoxTransition::Activated;
            log::debug!("VOX {}", if active { "on" } else { "off" });
            self.emit(RepeaterEvent::VoxChanged(active));
        }

        if self.config.dtmf.enabled {
            let key = self.dtmf.process(&self.input, now);
            if let Some(key) = key.filter(|_| !holdoff) {
                self.on_key(key, now);
            }
        }
        if let Some(outcome) = self.assembler.tick(now) {
            self.on_command_outcome(outcome, now);
        }

        // Decisions
        self.request_id_if_due(now);
        self.expire_requests(now);
        self.step(now);
        if let Some(effect) = self.ptt.tick(now) {
            self.apply_ptt_effect(effect, now);
        }

        // Output
        let ctx = FrameContext {
            active: self.state == RepeaterState::Active,
            on_air: self.ptt.is_on_air(),
        };
        let live = self.strategy.process(&self.input, &mut self.output, ctx);
        if !live {
            self.output.fill(0.0);
        }
        if ctx.on_air && !self.playback.is_empty() {
            for sample in self.output.iter_mut() {
                match self.playback.pop_front() {
                    Some(s) => *sample = s,
                    None => break,
                }
            }
            self.ptt.note_activity(now + FRAME_DURATION);
            self.last_generated = Some(now + FRAME_DURATION);
        }
        apply_gain(&mut self.output, self.config.output_gain);

        let n = output.len().min(FRAME_SIZE);
        output[..n].copy_from_slice(&self.output[..n]);

        self.publish_status();
    }

    /// Forces the transmitter off and stops processing. Idempotent.
    pub fn shutdown(&mut self, now: Duration) {
        if let Some(effect) = self.ptt.force_unkey() {
            self.apply_ptt_effect(effect, now);
        }
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.playback.clear();
        self.strategy.reset();
        self.vox.reset();
        self.dtmf.reset();
        self.assembler.clear();
        self.set_state(RepeaterState::Idle, now);
        self.publish_status();
        log::info!("Repeater core stopped");
    }

    /// Replaces the session config between frames.
    pub fn reconfigure(&mut self, config: RepeaterConfig) -> anyhow::Result<()> {
        let config = config.normalized();
        if config.mode != self.config.mode {
            anyhow::bail!(
                "mode cannot change during a session ({} -> {})",
                self.config.mode,
                config.mode
            );
        }
        self.vox
            .configure(config.threshold, config.attack(), config.release());
        self.dtmf.configure(&config.dtmf);
        self.assembler
            .set_timeout(Duration::from_millis(config.dtmf.digit_timeout_ms));
        self.ptt.set_timing(ptt_timing(&config));
        self.id.configure(config.id_interval(), config.auto_id);
        self.strategy.reconfigure(&config);
        self.courtesy = courtesy_tone(&config.courtesy);
        self.lead_in = lead_in_tone(&config.lead_in);
        self.config = config;
        log::info!("Repeater core reconfigured");
        Ok(())
    }

    // ── Transitions ─────────────────────────────────────────────────────────

    fn step(&mut self, now: Duration) {
        match self.state {
            RepeaterState::Idle => {
                if self.lockout && !self.vox.is_active() {
                    self.lockout = false;
                }
                let start = if self.strategy.vox_triggered() {
                    self.vox.is_active() && !self.lockout
                } else {
                    std::mem::take(&mut self.manual_start)
                };
                if start {
                    self.enter_active(now);
                } else if !self.vox.is_active() && !self.lockout {
                    self.start_announcement(now);
                }
            }
            RepeaterState::Active => {
                let ended = if self.strategy.vox_triggered() {
                    !self.vox.is_active()
                } else {
                    std::mem::take(&mut self.manual_stop)
                };
                if ended || self.strategy.limit_reached() {
                    self.end_activity(now);
                }
            }
            RepeaterState::CourtesyPending => {
                if self.playback.is_empty() {
                    if self.id.is_due(now) {
                        self.set_state(RepeaterState::IdPending, now);
                        self.step_id(now);
                    } else {
                        self.enter_idle(now);
                    }
                }
            }
            RepeaterState::IdPending => self.step_id(now),
            RepeaterState::Announcing => {
                if self.playback.is_empty() {
                    self.finish_id_playback(now);
                    self.enter_courtesy(now);
                }
            }
            RepeaterState::Timeout => {
                if !self.vox.is_active() {
                    self.lockout = false;
                    self.enter_idle(now);
                }
            }
        }
    }

    fn step_id(&mut self, now: Duration) {
        if self.playing_id {
            if self.playback.is_empty() {
                self.finish_id_playback(now);
                self.enter_idle(now);
            }
        } else if let Some(audio) = self.id_audio.take() {
            self.queue_lead_in();
            self.playback.extend(audio);
            self.playing_id = true;
            self.ptt.begin_key(now);
        } else if now.saturating_sub(self.state_since) >= self.config.announcement_wait() {
            log::warn!("Identification audio not ready; will retry after the next transmission");
            self.enter_idle(now);
        }
    }

    fn finish_id_playback(&mut self, now: Duration) {
        if self.playing_id {
            self.playing_id = false;
            self.id.mark_identified(now);
            log::info!("Station identified");
            self.emit(RepeaterEvent::Identified);
        }
    }

    fn enter_active(&mut self, now: Duration) {
        self.strategy.begin_activity();
        if self.strategy.keys_while_active() {
            self.ptt.begin_key(now);
        } else {
            log::info!("Recording started");
            self.emit(RepeaterEvent::RecordingStarted);
        }
        self.set_state(RepeaterState::Active, now);
    }

    fn end_activity(&mut self, now: Duration) {
        if self.strategy.keys_while_active() {
            self.strategy.end_activity(&mut self.playback);
        } else {
            self.queue_lead_in();
            let start = self.playback.len();
            let queued = self.strategy.end_activity(&mut self.playback);
            log::info!("Recording finished ({:.1}s)", queued.as_secs_f32());
            self.emit(RepeaterEvent::RecordingFinished(queued));
            self.publish_recording(start);
        }
        self.enter_courtesy(now);
    }

    /// Queues the lead-in ahead of generated audio that starts from an
    /// unkeyed transmitter.
    fn queue_lead_in(&mut self) {
        if self.config.lead_in.enabled
            && self.playback.is_empty()
            && self.ptt.state() == PttState::Unkeyed
        {
            self.playback.extend(self.lead_in.iter().copied());
        }
    }

    fn publish_recording(&mut self, start: usize) {
        let Some(tx) = &self.recordings_tx else {
            return;
        };
        let recording: Vec<f32> = self.playback.range(start..).copied().collect();
        match tx.try_send(recording) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => log::warn!("Recording queue full, recording not saved"),
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("Recording subscriber gone");
                self.recordings_tx = None;
            }
        }
    }

    fn enter_courtesy(&mut self, now: Duration) {
        if self.config.courtesy.enabled {
            self.playback.extend(self.courtesy.iter().copied());
        }
        if self.ptt.state() == PttState::Keyed {
            self.ptt.release(now);
        } else if !self.playback.is_empty() {
            self.ptt.begin_key(now);
        }
        self.set_state(RepeaterState::CourtesyPending, now);
    }

    fn enter_idle(&mut self, now: Duration) {
        self.ptt.release(now);
        self.set_state(RepeaterState::Idle, now);
    }

    /// Idle -> Announcing when a command response or requested ID is ready.
    fn start_announcement(&mut self, now: Duration) {
        let audio = if let Some(audio) = self.responses.pop_front() {
            audio
        } else if self.id.is_requested() && self.id_audio.is_some() {
            self.playing_id = true;
            self.id_audio.take().unwrap_or_default()
        } else {
            return;
        };
        self.queue_lead_in();
        self.playback.extend(audio);
        self.ptt.begin_key(now);
        self.set_state(RepeaterState::Announcing, now);
    }

    fn set_state(&mut self, to: RepeaterState, now: Duration) {
        if to == self.state {
            return;
        }
        let from = self.state;
        log::info!("State {} -> {}", from, to);
        self.state = to;
        self.state_since = now;
        self.manual_start = false;
        self.manual_stop = false;
        self.emit(RepeaterEvent::StateChanged { from, to });
    }

    // ── Keying ──────────────────────────────────────────────────────────────

    fn apply_ptt_effect(&mut self, effect: PttEffect, now: Duration) {
        match effect {
            PttEffect::KeyOn => {
                if let Err(e) = self.key_line.set_keyed(true) {
                    self.keying_fault(now, format!("key on failed: {:#}", e));
                    return;
                }
                self.hw_keyed = true;
                log::info!("Transmitter keyed");
                self.emit(RepeaterEvent::Keyed);
            }
            PttEffect::KeyOff => {
                self.key_off();
                log::info!("Transmitter unkeyed");
                self.emit(RepeaterEvent::Unkeyed);
            }
            PttEffect::TimedOut => {
                self.key_off();
                log::warn!(
                    "Timeout: transmitter keyed for {}s, forcing unkey",
                    self.config.timeout_ms / 1000
                );
                self.emit(RepeaterEvent::Timeout);
                self.abort_transmission();
                self.set_state(RepeaterState::Timeout, now);
            }
        }
        self.status
            .keyed
            .store(self.ptt.is_on_air(), Ordering::Relaxed);
    }

    fn key_off(&mut self) {
        self.hw_keyed = false;
        if let Err(e) = self.key_line.set_keyed(false) {
            log::error!("Key line failed to unkey: {:#}", e);
            self.emit(RepeaterEvent::KeyingFault(format!("key off failed: {:#}", e)));
        }
    }

    fn keying_fault(&mut self, now: Duration, reason: String) {
        log::error!("Keying fault: {}", reason);
        // A key-on the line refused never reached the air.
        if self.ptt.force_unkey().is_some() && self.hw_keyed {
            self.key_off();
            self.emit(RepeaterEvent::Unkeyed);
        }
        self.status.keyed.store(false, Ordering::Relaxed);
        self.abort_transmission();
        self.emit(RepeaterEvent::KeyingFault(reason));
        self.set_state(RepeaterState::Idle, now);
    }

    /// Drops queued audio and locks out re-triggering until the channel clears.
    fn abort_transmission(&mut self) {
        self.playback.clear();
        self.strategy.reset();
        self.playing_id = false;
        self.lockout = true;
    }

    fn in_holdoff(&self, now: Duration) -> bool {
        let holdoff = self.config.feedback_holdoff();
        !holdoff.is_zero()
            && self
                .last_generated
                .is_some_and(|t| now.saturating_sub(t) < holdoff)
    }

    // ── Commands ────────────────────────────────────────────────────────────

    fn on_key(&mut self, key: DtmfKey, now: Duration) {
        let accepted = self.strategy.accepts_commands()
            && matches!(
                self.state,
                RepeaterState::Active | RepeaterState::CourtesyPending
            );
        log::debug!("DTMF {} ({})", key, if accepted { "accepted" } else { "ignored" });
        self.emit(RepeaterEvent::DigitDetected { key, accepted });
        if accepted {
            if let Some(outcome) = self.assembler.push(key, now) {
                self.on_command_outcome(outcome, now);
            }
        }
    }

    fn on_command_outcome(&mut self, outcome: CommandOutcome, now: Duration) {
        match outcome {
            CommandOutcome::Submitted(code) => {
                log::info!("Command {} dispatched", code);
                self.emit(RepeaterEvent::CommandDispatched(code.clone()));
                self.send_request(AnnouncementKind::CommandResponse(code), now);
            }
            CommandOutcome::Cleared(reason @ (ClearReason::Star | ClearReason::Timeout)) => {
                log::info!("Command entry {}", reason);
                self.emit(RepeaterEvent::CommandCleared(reason));
            }
            CommandOutcome::Cleared(reason) => {
                log::info!("Command rejected: {}", reason);
                self.emit(RepeaterEvent::CommandRejected(reason));
            }
        }
    }

    // ── Announcements ───────────────────────────────────────────────────────

    fn send_request(&mut self, kind: AnnouncementKind, now: Duration) {
        let token = self.next_token;
        self.next_token += 1;
        let request_kind = match kind {
            AnnouncementKind::Identification => RequestKind::Identification,
            AnnouncementKind::CommandResponse(_) => RequestKind::CommandResponse,
        };
        match self.requests_tx.try_send(AnnouncementRequest { token, kind }) {
            Ok(()) => self.pending.push(PendingRequest {
                token,
                kind: request_kind,
                sent_at: now,
            }),
            Err(TrySendError::Full(request)) => {
                log::warn!("Announcement queue full, dropping {:?}", request.kind);
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("No announcement worker attached");
            }
        }
    }

    /// Prefetches the ID so it is ready when the transmission ends.
    fn request_id_if_due(&mut self, now: Duration) {
        let outstanding = self.id_audio.is_some()
            || self.playing_id
            || self
                .pending
                .iter()
                .any(|p| p.kind == RequestKind::Identification);
        if !outstanding && self.id.is_due(now) {
            self.send_request(AnnouncementKind::Identification, now);
        }
    }

    fn expire_requests(&mut self, now: Duration) {
        let limit = self.config.announcement_wait() * 2;
        self.pending.retain(|p| {
            let live = now.saturating_sub(p.sent_at) < limit;
            if !live {
                log::warn!("Announcement {} never arrived", p.token);
            }
            live
        });
    }

    fn drain_ready(&mut self) {
        while let Ok(ready) = self.ready_rx.try_recv() {
            let Some(idx) = self.pending.iter().position(|p| p.token == ready.token) else {
                log::warn!("Dropping unexpected announcement {}", ready.token);
                self.emit(RepeaterEvent::AnnouncementDropped(ready.token));
                continue;
            };
            let request = self.pending.swap_remove(idx);
            match request.kind {
                RequestKind::Identification => self.id_audio = Some(ready.audio),
                RequestKind::CommandResponse if ready.audio.is_empty() => {}
                RequestKind::CommandResponse => self.responses.push_back(ready.audio),
            }
        }
    }

    fn drain_controls(&mut self, now: Duration) {
        while let Ok(control) = self.control_rx.try_recv() {
            match control {
                Control::ManualStart => {
                    if self.strategy.accepts_manual() && self.state == RepeaterState::Idle {
                        self.manual_start = true;
                    } else {
                        log::debug!(
                            "Manual start ignored in {} / {}",
                            self.strategy.mode(),
                            self.state
                        );
                    }
                }
                Control::ManualStop => {
                    if self.strategy.accepts_manual() && self.state == RepeaterState::Active {
                        self.manual_stop = true;
                    }
                }
                Control::Identify => {
                    log::info!("Identification requested");
                    self.id.request_now();
                }
                Control::Reconfigure(config) => {
                    if let Err(e) = self.reconfigure(*config) {
                        log::warn!("Reconfiguration refused: {:#}", e);
                    }
                }
                Control::KeyingFault(reason) => self.keying_fault(now, reason),
                Control::Stop => {
                    self.shutdown(now);
                    return;
                }
            }
        }
    }

    // ── Outputs ─────────────────────────────────────────────────────────────

    fn emit(&self, event: RepeaterEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                log::warn!("Event queue full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn publish_status(&self) {
        let status = &self.status;
        status.keyed.store(self.ptt.is_on_air(), Ordering::Relaxed);
        status.state.store(self.state.as_u8(), Ordering::Relaxed);
        status
            .level
            .store(self.vox.smoothed_level().to_bits(), Ordering::Relaxed);
        status.vox.store(self.vox.is_active(), Ordering::Relaxed);
        status
            .command
            .store(self.assembler.snapshot().pack(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepeaterMode;
    use crate::constants::frame_time;
    use crate::dtmf::tone_pair;
    use std::sync::Mutex;

    /// Records every keying call.
    #[derive(Clone, Default)]
    struct LogKeyLine(Arc<Mutex<Vec<bool>>>);

    impl KeyLine for LogKeyLine {
        fn set_keyed(&mut self, keyed: bool) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(keyed);
            Ok(())
        }
    }

    struct FailingKeyLine;

    impl KeyLine for FailingKeyLine {
        fn set_keyed(&mut self, keyed: bool) -> anyhow::Result<()> {
            if keyed {
                anyhow::bail!("relay not responding");
            }
            Ok(())
        }
    }

    struct Rig {
        core: RepeaterCore,
        handle: CoreHandle,
        keys: LogKeyLine,
        frame: u64,
    }

    impl Rig {
        fn new(config: RepeaterConfig) -> Self {
            let keys = LogKeyLine::default();
            let (core, handle) = RepeaterCore::new(config, Box::new(keys.clone()));
            Self {
                core,
                handle,
                keys,
                frame: 0,
            }
        }

        fn now(&self) -> Duration {
            frame_time(self.frame)
        }

        fn feed(&mut self, input: &[f32]) -> Vec<f32> {
            let mut output = vec![0.0; FRAME_SIZE];
            let now = self.now();
            self.core.process_frame(input, &mut output, now);
            self.frame += 1;
            output
        }

        fn run(&mut self, level: f32, frames: usize) {
            for _ in 0..frames {
                self.feed(&[level; FRAME_SIZE]);
            }
        }

        fn events(&self) -> Vec<RepeaterEvent> {
            self.handle.events.try_iter().collect()
        }
    }

    fn quiet_config(mode: RepeaterMode) -> RepeaterConfig {
        RepeaterConfig {
            mode,
            auto_id: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_state_codes_roundtrip() {
        for state in RepeaterState::ALL {
            assert_eq!(RepeaterState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_full_repeater_cycle() {
        let mut rig = Rig::new(quiet_config(RepeaterMode::FullRepeater));
        rig.run(0.3, 200);
        assert_eq!(rig.core.state(), RepeaterState::Active);
        assert!(rig.handle.status.is_keyed());

        rig.run(0.0, 600);
        assert_eq!(rig.core.state(), RepeaterState::Idle);
        assert_eq!(*rig.keys.0.lock().unwrap(), vec![true, false]);

        let events = rig.events();
        assert!(events.contains(&RepeaterEvent::Keyed));
        assert!(events.contains(&RepeaterEvent::Unkeyed));
        assert!(events.contains(&RepeaterEvent::StateChanged {
            from: RepeaterState::Active,
            to: RepeaterState::CourtesyPending
        }));
    }

    #[test]
    fn test_courtesy_tone_follows_relayed_audio() {
        let mut rig = Rig::new(quiet_config(RepeaterMode::FullRepeater));
        rig.run(0.3, 200);
        let mut outputs = Vec::new();
        for _ in 0..300 {
            outputs.push(rig.feed(&[0.0; FRAME_SIZE]));
        }
        // Relayed speech (constant 0.3) first, tone later.
        let first_relay = outputs.iter().position(|f| f[0] == 0.3);
        let first_tone = outputs
            .iter()
            .position(|f| f.iter().any(|s| *s != 0.0 && *s != 0.3));
        assert!(first_relay.is_some());
        assert!(first_tone.unwrap() > first_relay.unwrap());
    }

    #[test]
    fn test_wrong_length_frame_is_silence() {
        let mut rig = Rig::new(quiet_config(RepeaterMode::FullRepeater));
        for _ in 0..100 {
            rig.feed(&[0.5; 100]);
        }
        assert_eq!(rig.core.state(), RepeaterState::Idle);
        assert!(rig.events().is_empty());
    }

    #[test]
    fn test_keying_fault_returns_to_idle() {
        let (mut core, handle) = RepeaterCore::new(
            quiet_config(RepeaterMode::FullRepeater),
            Box::new(FailingKeyLine),
        );
        let mut out = vec![0.0; FRAME_SIZE];
        for i in 0..100u32 {
            core.process_frame(&[0.3; FRAME_SIZE], &mut out, FRAME_DURATION * i);
        }
        assert_eq!(core.state(), RepeaterState::Idle);
        assert_eq!(core.ptt_state(), PttState::Unkeyed);
        let events: Vec<_> = handle.events.try_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, RepeaterEvent::KeyingFault(_))));
        // Locked out while the channel stays busy.
        assert!(!events.contains(&RepeaterEvent::Keyed));
        // Never on air, so nothing to report as unkeyed.
        assert!(!events.contains(&RepeaterEvent::Unkeyed));
    }

    #[test]
    fn test_extreme_durations_are_bounded() {
        for mode in RepeaterMode::ALL {
            let config = RepeaterConfig {
                mode,
                attack_ms: u64::MAX,
                release_ms: u64::MAX,
                pre_key_ms: u64::MAX,
                tail_ms: u64::MAX,
                min_key_ms: u64::MAX,
                timeout_ms: u64::MAX,
                id_interval_ms: u64::MAX,
                delay_ms: u64::MAX,
                max_record_ms: u64::MAX,
                feedback_holdoff_ms: u64::MAX,
                announcement_wait_ms: u64::MAX,
                ..Default::default()
            };
            let mut rig = Rig::new(config);
            assert_eq!(rig.core.config().attack_ms, 5000);
            assert_eq!(rig.core.config().pre_key_ms, 2000);
            rig.run(0.3, 50);
            rig.handle.control.send(Control::ManualStart).unwrap();
            rig.run(0.3, 50);
            rig.run(0.0, 50);
            let now = rig.now();
            rig.core.shutdown(now);
        }
    }

    #[test]
    fn test_lead_in_precedes_replay() {
        let mut config = quiet_config(RepeaterMode::Manual);
        config.lead_in.enabled = true;
        let lead_in_frames = config.lead_in.duration_ms as usize / 10;
        let mut rig = Rig::new(config);
        let recordings = rig.core.recordings();

        rig.handle.control.send(Control::ManualStart).unwrap();
        rig.run(0.3, 100);
        rig.handle.control.send(Control::ManualStop).unwrap();
        let outputs: Vec<Vec<f32>> = (0..300).map(|_| rig.feed(&[0.0; FRAME_SIZE])).collect();

        let first_sound = outputs
            .iter()
            .position(|f| f.iter().any(|s| *s != 0.0))
            .unwrap();
        let first_replay = outputs
            .iter()
            .position(|f| f.iter().all(|s| *s == 0.3))
            .unwrap();
        assert!(outputs[first_sound].iter().any(|s| *s != 0.3));
        assert!(first_replay >= first_sound + lead_in_frames - 1);

        // The saved recording holds the speech only.
        let recording = recordings.try_recv().unwrap();
        assert!(recording.len() >= 99 * FRAME_SIZE);
        assert!(recording.iter().all(|s| *s == 0.3));
    }

    #[test]
    fn test_live_modes_publish_no_recordings() {
        let mut rig = Rig::new(quiet_config(RepeaterMode::FullRepeater));
        let recordings = rig.core.recordings();
        rig.run(0.3, 100);
        rig.run(0.0, 300);
        assert!(recordings.try_recv().is_err());
    }

    #[test]
    fn test_async_keying_fault() {
        let mut rig = Rig::new(quiet_config(RepeaterMode::FullRepeater));
        rig.run(0.3, 100);
        assert!(rig.handle.status.is_keyed());
        rig.handle
            .control
            .send(Control::KeyingFault("serial port gone".into()))
            .unwrap();
        rig.run(0.3, 1);
        assert_eq!(rig.core.state(), RepeaterState::Idle);
        assert!(!rig.handle.status.is_keyed());
        assert_eq!(*rig.keys.0.lock().unwrap(), vec![true, false]);
        // Channel clears, then a new transmission keys again.
        rig.run(0.0, 100);
        rig.run(0.3, 100);
        assert_eq!(rig.core.state(), RepeaterState::Active);
    }

    #[test]
    fn test_manual_mode_ignores_vox() {
        let mut rig = Rig::new(quiet_config(RepeaterMode::Manual));
        rig.run(0.3, 100);
        assert_eq!(rig.core.state(), RepeaterState::Idle);

        rig.handle.control.send(Control::ManualStart).unwrap();
        rig.run(0.3, 100);
        assert_eq!(rig.core.state(), RepeaterState::Active);
        assert_eq!(rig.core.ptt_state(), PttState::Unkeyed);

        rig.handle.control.send(Control::ManualStop).unwrap();
        rig.run(0.0, 1);
        assert_eq!(rig.core.state(), RepeaterState::CourtesyPending);
        let events = rig.events();
        assert!(events.contains(&RepeaterEvent::RecordingStarted));
        assert!(events
            .iter()
            .any(|e| matches!(e, RepeaterEvent::RecordingFinished(d) if *d >= Duration::from_millis(990))));

        // Recording replays on air, then the courtesy tone, then idle.
        rig.run(0.0, 400);
        assert_eq!(rig.core.state(), RepeaterState::Idle);
        assert_eq!(*rig.keys.0.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_reconfigure_refuses_mode_change() {
        let mut rig = Rig::new(quiet_config(RepeaterMode::FullRepeater));
        let changed = RepeaterConfig {
            tail_ms: 200,
            ..quiet_config(RepeaterMode::FullRepeater)
        };
        assert!(rig.core.reconfigure(changed).is_ok());
        assert_eq!(rig.core.config().tail_ms, 200);
        assert!(rig
            .core
            .reconfigure(quiet_config(RepeaterMode::Manual))
            .is_err());
        assert_eq!(rig.core.config().mode, RepeaterMode::FullRepeater);
    }

    #[test]
    fn test_stop_control_unkeys_once() {
        let mut rig = Rig::new(quiet_config(RepeaterMode::FullRepeater));
        rig.run(0.3, 100);
        rig.handle.control.send(Control::Stop).unwrap();
        rig.run(0.3, 10);
        assert!(rig.core.is_stopped());
        let now = rig.now();
        rig.core.shutdown(now);
        assert_eq!(*rig.keys.0.lock().unwrap(), vec![true, false]);
        let out = rig.feed(&[0.3; FRAME_SIZE]);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_digits_ignored_in_delay_line_mode() {
        let mut rig = Rig::new(quiet_config(RepeaterMode::ContinuousDelayLine));
        let mut start = 0;
        for c in "12#".chars() {
            let key = DtmfKey::from_char(c).unwrap();
            for _ in 0..10 {
                rig.feed(&tone_pair(key, 0.2, FRAME_SIZE, start));
                start += FRAME_SIZE;
            }
            rig.run(0.0, 10);
        }
        let events = rig.events();
        assert!(!events
            .iter()
            .any(|e| matches!(e, RepeaterEvent::CommandDispatched(_))));
        assert!(events
            .iter()
            .any(|e| matches!(e, RepeaterEvent::DigitDetected { accepted: false, .. })));
    }

    #[test]
    fn test_feedback_holdoff_mutes_input() {
        let config = RepeaterConfig {
            feedback_holdoff_ms: 1500,
            ..quiet_config(RepeaterMode::FullRepeater)
        };
        let mut rig = Rig::new(config);
        rig.run(0.3, 100);
        rig.run(0.0, 80);
        assert_eq!(rig.core.state(), RepeaterState::CourtesyPending);
        // Our own courtesy tone coming back on the receiver is ignored.
        rig.run(0.3, 150);
        assert_ne!(rig.core.state(), RepeaterState::Active);
    }
}
