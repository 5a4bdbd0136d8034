//! Session configuration for the repeater core.
//!
//! A `RepeaterConfig` is read once at session start and only replaced as a
//! whole (see `Control::Reconfigure`). All clamping happens in
//! [`RepeaterConfig::normalized`], never in the per-frame path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Operating mode, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeaterMode {
    /// Operator starts and stops recordings; each is replayed once.
    Manual,
    /// VOX-triggered record, then a single replay ("parrot").
    TimedAutoReplay,
    /// Everything heard is retransmitted after a fixed delay.
    ContinuousDelayLine,
    /// Live repeat with courtesy tone, auto-ID and DTMF commands.
    FullRepeater,
}

impl RepeaterMode {
    pub const ALL: [RepeaterMode; 4] = [
        RepeaterMode::Manual,
        RepeaterMode::TimedAutoReplay,
        RepeaterMode::ContinuousDelayLine,
        RepeaterMode::FullRepeater,
    ];
}

impl fmt::Display for RepeaterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepeaterMode::Manual => "manual",
            RepeaterMode::TimedAutoReplay => "timed-replay",
            RepeaterMode::ContinuousDelayLine => "delay-line",
            RepeaterMode::FullRepeater => "repeater",
        };
        f.write_str(name)
    }
}

impl FromStr for RepeaterMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RepeaterMode::ALL
            .into_iter()
            .find(|mode| mode.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown mode '{}'", s))
    }
}

/// Courtesy tone played after each transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourtesyToneConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_courtesy_freq")]
    pub freq_hz: f32,
    #[serde(default = "default_courtesy_volume")]
    pub volume: f32,
    #[serde(default = "default_courtesy_duration_ms")]
    pub duration_ms: u64,
    /// Silence sent after the beep so a VOX-keyed radio drops cleanly.
    #[serde(default = "default_tail_silence_ms")]
    pub tail_silence_ms: u64,
}

impl Default for CourtesyToneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            freq_hz: default_courtesy_freq(),
            volume: default_courtesy_volume(),
            duration_ms: default_courtesy_duration_ms(),
            tail_silence_ms: default_tail_silence_ms(),
        }
    }
}

/// Lead-in beep queued ahead of generated audio (replays, announcements)
/// when the transmitter starts from unkeyed, to open a radio's own VOX
/// before the first syllable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadInConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_lead_in_freq")]
    pub freq_hz: f32,
    #[serde(default = "default_lead_in_volume")]
    pub volume: f32,
    #[serde(default = "default_lead_in_duration_ms")]
    pub duration_ms: u64,
}

impl Default for LeadInConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            freq_hz: default_lead_in_freq(),
            volume: default_lead_in_volume(),
            duration_ms: default_lead_in_duration_ms(),
        }
    }
}

/// DTMF detection tuning. These are empirical constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtmfConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum continuous detection before a key is confirmed.
    #[serde(default = "default_dtmf_hold_ms")]
    pub hold_ms: u64,
    /// Partial codes are discarded after this much silence between keys.
    #[serde(default = "default_digit_timeout_ms")]
    pub digit_timeout_ms: u64,
    /// Winner-to-runner-up power ratio required in each tone group.
    #[serde(default = "default_separation_ratio")]
    pub separation_ratio: f32,
    /// Noise floor: minimum normalized power of each tone.
    #[serde(default = "default_min_tone_power")]
    pub min_tone_power: f32,
    /// Maximum level difference between the two tones.
    #[serde(default = "default_max_twist_db")]
    pub max_twist_db: f32,
}

impl Default for DtmfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hold_ms: default_dtmf_hold_ms(),
            digit_timeout_ms: default_digit_timeout_ms(),
            separation_ratio: default_separation_ratio(),
            min_tone_power: default_min_tone_power(),
            max_twist_db: default_max_twist_db(),
        }
    }
}

/// Everything the core needs for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeaterConfig {
    #[serde(default = "default_mode")]
    pub mode: RepeaterMode,
    /// VOX threshold on normalized loudness (0..1).
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_attack_ms")]
    pub attack_ms: u64,
    #[serde(default = "default_release_ms")]
    pub release_ms: u64,
    #[serde(default = "default_pre_key_ms")]
    pub pre_key_ms: u64,
    #[serde(default = "default_tail_ms")]
    pub tail_ms: u64,
    /// Shortest key-down, so brief kerchunks still produce a clean carrier.
    #[serde(default = "default_min_key_ms")]
    pub min_key_ms: u64,
    /// Hard limit on continuous key-down.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub auto_id: bool,
    #[serde(default = "default_id_interval_ms")]
    pub id_interval_ms: u64,
    #[serde(default = "default_gain")]
    pub input_gain: f32,
    #[serde(default = "default_gain")]
    pub output_gain: f32,
    #[serde(default)]
    pub courtesy: CourtesyToneConfig,
    #[serde(default)]
    pub lead_in: LeadInConfig,
    #[serde(default)]
    pub dtmf: DtmfConfig,
    /// Delay of the continuous delay line mode.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Longest recording in the replay modes.
    #[serde(default = "default_max_record_ms")]
    pub max_record_ms: u64,
    /// Input is ignored this long after generated audio ends (0 = off).
    #[serde(default)]
    pub feedback_holdoff_ms: u64,
    /// How long IdPending waits for the ID audio to be rendered.
    #[serde(default = "default_announcement_wait_ms")]
    pub announcement_wait_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_mode() -> RepeaterMode {
    RepeaterMode::FullRepeater
}

fn default_threshold() -> f32 {
    0.05
}

fn default_attack_ms() -> u64 {
    100
}

fn default_release_ms() -> u64 {
    500
}

fn default_pre_key_ms() -> u64 {
    300
}

fn default_tail_ms() -> u64 {
    1000
}

fn default_min_key_ms() -> u64 {
    500
}

fn default_timeout_ms() -> u64 {
    180_000 // 3 minutes
}

fn default_id_interval_ms() -> u64 {
    600_000 // 10 minutes
}

fn default_gain() -> f32 {
    1.0
}

fn default_courtesy_freq() -> f32 {
    1000.0
}

fn default_courtesy_volume() -> f32 {
    0.5
}

fn default_courtesy_duration_ms() -> u64 {
    500
}

fn default_tail_silence_ms() -> u64 {
    500
}

fn default_lead_in_freq() -> f32 {
    1500.0
}

fn default_lead_in_volume() -> f32 {
    0.45
}

fn default_lead_in_duration_ms() -> u64 {
    500
}

fn default_dtmf_hold_ms() -> u64 {
    40
}

fn default_digit_timeout_ms() -> u64 {
    5000
}

fn default_separation_ratio() -> f32 {
    6.0
}

fn default_min_tone_power() -> f32 {
    1e-4
}

fn default_max_twist_db() -> f32 {
    8.0
}

fn default_delay_ms() -> u64 {
    2000
}

fn default_max_record_ms() -> u64 {
    30_000
}

fn default_announcement_wait_ms() -> u64 {
    5000
}

impl Default for RepeaterConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            threshold: default_threshold(),
            attack_ms: default_attack_ms(),
            release_ms: default_release_ms(),
            pre_key_ms: default_pre_key_ms(),
            tail_ms: default_tail_ms(),
            min_key_ms: default_min_key_ms(),
            timeout_ms: default_timeout_ms(),
            auto_id: true,
            id_interval_ms: default_id_interval_ms(),
            input_gain: default_gain(),
            output_gain: default_gain(),
            courtesy: CourtesyToneConfig::default(),
            lead_in: LeadInConfig::default(),
            dtmf: DtmfConfig::default(),
            delay_ms: default_delay_ms(),
            max_record_ms: default_max_record_ms(),
            feedback_holdoff_ms: 0,
            announcement_wait_ms: default_announcement_wait_ms(),
        }
    }
}

impl RepeaterConfig {
    /// Returns a copy with every value clamped into its working range.
    pub fn normalized(&self) -> Self {
        let mut cfg = self.clone();
        cfg.threshold = if cfg.threshold.is_finite() {
            cfg.threshold.clamp(0.001, 0.999)
        } else {
            default_threshold()
        };
        cfg.input_gain = clamp_gain(cfg.input_gain);
        cfg.output_gain = clamp_gain(cfg.output_gain);
        cfg.attack_ms = cfg.attack_ms.clamp(1, 5000);
        cfg.release_ms = cfg.release_ms.clamp(1, 5000);
        cfg.pre_key_ms = cfg.pre_key_ms.min(2000);
        cfg.tail_ms = cfg.tail_ms.min(10_000);
        cfg.timeout_ms = cfg.timeout_ms.clamp(1000, 3_600_000);
        cfg.min_key_ms = cfg.min_key_ms.min(cfg.timeout_ms);
        cfg.id_interval_ms = cfg.id_interval_ms.clamp(1000, 86_400_000);
        cfg.delay_ms = cfg.delay_ms.clamp(100, 30_000);
        cfg.max_record_ms = cfg.max_record_ms.clamp(1000, 600_000);
        cfg.feedback_holdoff_ms = cfg.feedback_holdoff_ms.min(10_000);
        cfg.announcement_wait_ms = cfg.announcement_wait_ms.clamp(100, 60_000);
        cfg.courtesy.freq_hz = cfg.courtesy.freq_hz.clamp(100.0, 4000.0);
        cfg.courtesy.volume = cfg.courtesy.volume.clamp(0.0, 1.0);
        cfg.courtesy.duration_ms = cfg.courtesy.duration_ms.clamp(20, 3000);
        cfg.courtesy.tail_silence_ms = cfg.courtesy.tail_silence_ms.min(5000);
        cfg.lead_in.freq_hz = cfg.lead_in.freq_hz.clamp(100.0, 4000.0);
        cfg.lead_in.volume = cfg.lead_in.volume.clamp(0.0, 1.0);
        cfg.lead_in.duration_ms = cfg.lead_in.duration_ms.clamp(20, 3000);
        cfg.dtmf.hold_ms = cfg.dtmf.hold_ms.clamp(10, 1000);
        cfg.dtmf.digit_timeout_ms = cfg.dtmf.digit_timeout_ms.clamp(500, 60_000);
        cfg.dtmf.separation_ratio = cfg.dtmf.separation_ratio.max(1.0);
        cfg.dtmf.min_tone_power = cfg.dtmf.min_tone_power.max(1e-9);
        cfg.dtmf.max_twist_db = cfg.dtmf.max_twist_db.clamp(0.0, 40.0);
        cfg
    }

    pub fn attack(&self) -> Duration {
        Duration::from_millis(self.attack_ms)
    }

    pub fn release(&self) -> Duration {
        Duration::from_millis(self.release_ms)
    }

    pub fn pre_key(&self) -> Duration {
        Duration::from_millis(self.pre_key_ms)
    }

    pub fn tail(&self) -> Duration {
        Duration::from_millis(self.tail_ms)
    }

    pub fn min_key(&self) -> Duration {
        Duration::from_millis(self.min_key_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn id_interval(&self) -> Duration {
        Duration::from_millis(self.id_interval_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn max_record(&self) -> Duration {
        Duration::from_millis(self.max_record_ms)
    }

    pub fn feedback_holdoff(&self) -> Duration {
        Duration::from_millis(self.feedback_holdoff_ms)
    }

    pub fn announcement_wait(&self) -> Duration {
        Duration::from_millis(self.announcement_wait_ms)
    }
}

fn clamp_gain(gain: f32) -> f32 {
    if gain.is_finite() {
        gain.clamp(0.0, 2.0)
    } else {
        1.0
    }
}
