//! Tone generator with phase accumulator and fade envelope
//!
//! Used for the courtesy and lead-in tones and, keyed on/off, for Morse
//! announcements.
//! Linear fades keep key transitions click-free.

use crate::config::{CourtesyToneConfig, LeadInConfig};
use crate::constants::{samples_for, SAMPLE_RATE};
use std::f32::consts::TAU;
use std::time::Duration;

/// Fade length applied to generated tones (10ms)
pub const FADE: Duration = Duration::from_millis(10);

/// Fade envelope state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeState {
    Silent,
    FadeIn,
    Sustain,
    FadeOut,
}

/// Sine generator keyed by a boolean per sample.
pub struct ToneGen {
    phase: f32,
    phase_inc: f32,
    volume: f32,
    fade_state: FadeState,
    fade_pos: usize,
    fade_len: usize,
}

impl ToneGen {
    /// # Arguments
    /// * `freq_hz` - Tone frequency in Hz
    /// * `volume` - Peak amplitude (0..1)
    /// * `fade` - Ramp length for both edges
    pub fn new(freq_hz: f32, volume: f32, fade: Duration) -> Self {
        Self {
            phase: 0.0,
            phase_inc: TAU * freq_hz / SAMPLE_RATE as f32,
            volume,
            fade_state: FadeState::Silent,
            fade_pos: 0,
            fade_len: samples_for(fade).max(1),
        }
    }

    #[inline]
    pub fn fade_state(&self) -> FadeState {
        self.fade_state
    }

    /// Next sample; `key_down` selects tone or silence.
    #[inline]
    pub fn next_sample(&mut self, key_down: bool) -> f32 {
        let envelope = self.update_fade(key_down);
        if envelope == 0.0 {
            return 0.0;
        }
        let sample = self.phase.sin() * self.volume * envelope;
        self.phase += self.phase_inc;
        if self.phase >= TAU {
            self.phase -= TAU;
        }
        sample
    }

    /// Appends `samples` samples at a fixed key state.
    pub fn render_into(&mut self, out: &mut Vec<f32>, key_down: bool, samples: usize) {
        out.reserve(samples);
        for _ in 0..samples {
            out.push(self.next_sample(key_down));
        }
    }

    fn update_fade(&mut self, key_down: bool) -> f32 {
        match (self.fade_state, key_down) {
            (FadeState::Silent, true) => {
                self.fade_state = FadeState::FadeIn;
                self.fade_pos = 0;
                0.0
            }
            (FadeState::FadeIn, true) => {
                self.fade_pos += 1;
                if self.fade_pos >= self.fade_len {
                    self.fade_state = FadeState::Sustain;
                    1.0
                } else {
                    self.fade_pos as f32 / self.fade_len as f32
                }
            }
            (FadeState::Sustain, true) => 1.0,
            (FadeState::FadeIn, false) | (FadeState::Sustain, false) => {
                // Ramp down from wherever the fade-in got to.
                if self.fade_state == FadeState::Sustain {
                    self.fade_pos = self.fade_len;
                }
                self.fade_state = FadeState::FadeOut;
                self.fade_pos as f32 / self.fade_len as f32
            }
            (FadeState::FadeOut, _) => {
                if self.fade_pos == 0 {
                    self.fade_state = FadeState::Silent;
                    self.phase = 0.0;
                    0.0
                } else {
                    self.fade_pos -= 1;
                    self.fade_pos as f32 / self.fade_len as f32
                }
            }
            (FadeState::Silent, false) => 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.phase = 0.0;
        self.fade_state = FadeState::Silent;
        self.fade_pos = 0;
    }
}

/// A single beep with faded edges, ending in silence.
fn beep(freq_hz: f32, volume: f32, duration: Duration) -> Vec<f32> {
    let mut gen = ToneGen::new(freq_hz, volume, FADE);
    let total = samples_for(duration);
    let fade = samples_for(FADE);
    let mut out = Vec::with_capacity(total + fade);
    gen.render_into(&mut out, true, total.saturating_sub(fade));
    while gen.fade_state() != FadeState::Silent {
        out.push(gen.next_sample(false));
    }
    out
}

/// Renders the courtesy tone: the configured beep followed by the tail
/// silence.
pub fn courtesy_tone(config: &CourtesyToneConfig) -> Vec<f32> {
    let mut out = beep(
        config.freq_hz,
        config.volume,
        Duration::from_millis(config.duration_ms),
    );
    let silence = samples_for(Duration::from_millis(config.tail_silence_ms));
    out.resize(out.len() + silence, 0.0);
    out
}

pub fn lead_in_tone(config: &LeadInConfig) -> Vec<f32> {
    beep(
        config.freq_hz,
        config.volume,
        Duration::from_millis(config.duration_ms),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::rms;

    #[test]
    fn test_courtesy_tone_shape() {
        let config = CourtesyToneConfig::default();
        let tone = courtesy_tone(&config);
        let beep_len = samples_for(Duration::from_millis(config.duration_ms));
        let silence = samples_for(Duration::from_millis(config.tail_silence_ms));
        assert!(
            tone.len().abs_diff(beep_len + silence) <= 2,
            "len {}",
            tone.len()
        );
        assert_eq!(tone[0], 0.0);
        assert!(tone[tone.len() - silence..].iter().all(|s| *s == 0.0));
        let peak = tone.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak <= config.volume + 1e-6);
        assert!(peak > config.volume * 0.95);
    }

    #[test]
    fn test_lead_in_tone() {
        let config = LeadInConfig::default();
        let tone = lead_in_tone(&config);
        let expected = samples_for(Duration::from_millis(config.duration_ms));
        assert!(tone.len().abs_diff(expected) <= 2);
        assert!(tone.last().unwrap().abs() < 1e-3);
        let peak = tone.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > config.volume * 0.95 && peak <= config.volume + 1e-6);
    }

    #[test]
    fn test_steady_state_level() {
        let mut gen = ToneGen::new(1000.0, 0.5, FADE);
        let mut out = Vec::new();
        gen.render_into(&mut out, true, 4800);
        // Sine RMS is peak / sqrt(2).
        let steady = rms(&out[960..]);
        assert!((steady - 0.5 / 2f32.sqrt()).abs() < 0.01);
    }

    #[test]
    fn test_fade_out_returns_to_silence() {
        let mut gen = ToneGen::new(700.0, 1.0, FADE);
        let mut out = Vec::new();
        gen.render_into(&mut out, true, 100);
        assert_eq!(gen.fade_state(), FadeState::FadeIn);
        gen.render_into(&mut out, false, 1000);
        assert_eq!(gen.fade_state(), FadeState::Silent);
        assert!(out[900..].iter().all(|s| *s == 0.0));
    }
}
