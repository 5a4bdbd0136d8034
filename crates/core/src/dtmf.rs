//! DTMF decoder: Goertzel energy bank, digit classification and debounce.
//!
//! Keypad frequencies:
//! - Low group:  697, 770, 852, 941 Hz
//! - High group: 1209, 1336, 1477, 1633 Hz
//!
//! Each frame is appended to a 40ms sliding window (25Hz resolution, enough
//! to separate the 73Hz low-group spacing). The Goertzel filters use the exact
//! tone frequency rather than the nearest integer bin.

use crate::config::DtmfConfig;
use crate::constants::{DTMF_WINDOW, SAMPLE_RATE};
use std::f32::consts::PI;
use std::fmt;
use std::time::Duration;

pub const LOW_FREQS: [f32; 4] = [697.0, 770.0, 852.0, 941.0];
pub const HIGH_FREQS: [f32; 4] = [1209.0, 1336.0, 1477.0, 1633.0];

/// Guards the confidence ratio against an all-zero remainder.
const POWER_EPSILON: f32 = 1e-12;

/// One key of the 4x4 DTMF keypad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtmfKey {
    Digit(u8),
    Star,
    Pound,
    Letter(char),
}

const KEYPAD: [[DtmfKey; 4]; 4] = [
    [DtmfKey::Digit(1), DtmfKey::Digit(2), DtmfKey::Digit(3), DtmfKey::Letter('A')],
    [DtmfKey::Digit(4), DtmfKey::Digit(5), DtmfKey::Digit(6), DtmfKey::Letter('B')],
    [DtmfKey::Digit(7), DtmfKey::Digit(8), DtmfKey::Digit(9), DtmfKey::Letter('C')],
    [DtmfKey::Star, DtmfKey::Digit(0), DtmfKey::Pound, DtmfKey::Letter('D')],
];

impl DtmfKey {
    pub fn as_char(self) -> char {
        match self {
            DtmfKey::Digit(d) => char::from(b'0' + d),
            DtmfKey::Star => '*',
            DtmfKey::Pound => '#',
            DtmfKey::Letter(c) => c,
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0'..='9' => Some(DtmfKey::Digit(c as u8 - b'0')),
            '*' => Some(DtmfKey::Star),
            '#' => Some(DtmfKey::Pound),
            'A'..='D' => Some(DtmfKey::Letter(c)),
            'a'..='d' => Some(DtmfKey::Letter(c.to_ascii_uppercase())),
            _ => None,
        }
    }

    /// (low, high) tone pair in Hz.
    pub fn frequencies(self) -> (f32, f32) {
        for (row, keys) in KEYPAD.iter().enumerate() {
            for (col, key) in keys.iter().enumerate() {
                if *key == self {
                    return (LOW_FREQS[row], HIGH_FREQS[col]);
                }
            }
        }
        // Unreachable for keys built through the constructors above.
        (0.0, 0.0)
    }
}

impl fmt::Display for DtmfKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Result of classifying one analysis window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DigitEvent {
    pub key: Option<DtmfKey>,
    /// Winning pair power over the remaining six.
    pub confidence: f32,
    /// Normalized power per frequency, low group first.
    pub energies: [f32; 8],
}

/// Precomputed Goertzel coefficients for the eight keypad frequencies.
struct GoertzelBank {
    coeff: [f32; 8],
    cos: [f32; 8],
    sin: [f32; 8],
}

impl GoertzelBank {
    fn new(sample_rate: f32) -> Self {
        let mut bank = Self {
            coeff: [0.0; 8],
            cos: [0.0; 8],
            sin: [0.0; 8],
        };
        for (i, &freq) in LOW_FREQS.iter().chain(HIGH_FREQS.iter()).enumerate() {
            let omega = 2.0 * PI * freq / sample_rate;
            bank.cos[i] = omega.cos();
            bank.sin[i] = omega.sin();
            bank.coeff[i] = 2.0 * bank.cos[i];
        }
        bank
    }

    /// Power at each frequency, scaled so a sinusoid of amplitude A reads ~A^2.
    fn energies(&self, samples: &[f32]) -> [f32; 8] {
        let mut out = [0.0f32; 8];
        if samples.is_empty() {
            return out;
        }
        let n = samples.len() as f32;
        let scale = 4.0 / (n * n);
        for (i, energy) in out.iter_mut().enumerate() {
            let coeff = self.coeff[i];
            let mut q1 = 0.0f32;
            let mut q2 = 0.0f32;
            for &sample in samples {
                let q0 = coeff.mul_add(q1, sample - q2);
                q2 = q1;
                q1 = q0;
            }
            let real = q1 - q2 * self.cos[i];
            let imag = q2 * self.sin[i];
            *energy = (real * real + imag * imag) * scale;
        }
        out
    }
}

/// Index and power of the strongest entry plus the runner-up power.
fn strongest(group: &[f32]) -> (usize, f32, f32) {
    let mut best = 0;
    for (i, &power) in group.iter().enumerate() {
        if power > group[best] {
            best = i;
        }
    }
    let runner_up = group
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != best)
        .map(|(_, &p)| p)
        .fold(0.0f32, f32::max);
    (best, group[best], runner_up)
}

pub struct DtmfDecoder {
    bank: GoertzelBank,
    window: Vec<f32>,
    separation_ratio: f32,
    min_tone_power: f32,
    max_twist_ratio: f32,
    hold: Duration,

    // Debounce
    candidate: Option<DtmfKey>,
    candidate_since: Duration,
    armed: bool,
}

impl DtmfDecoder {
    pub fn new(config: &DtmfConfig) -> Self {
        let mut decoder = Self {
            bank: GoertzelBank::new(SAMPLE_RATE as f32),
            window: vec![0.0; DTMF_WINDOW],
            separation_ratio: 0.0,
            min_tone_power: 0.0,
            max_twist_ratio: 0.0,
            hold: Duration::ZERO,
            candidate: None,
            candidate_since: Duration::ZERO,
            armed: true,
        };
        decoder.configure(config);
        decoder
    }

    pub fn configure(&mut self, config: &DtmfConfig) {
        self.separation_ratio = config.separation_ratio;
        self.min_tone_power = config.min_tone_power;
        self.max_twist_ratio = 10f32.powf(config.max_twist_db / 10.0);
        self.hold = Duration::from_millis(config.hold_ms);
    }

    /// Classifies a block of samples without touching debounce state.
    pub fn classify(&self, samples: &[f32]) -> DigitEvent {
        let energies = self.bank.energies(samples);
        let (low_idx, low_power, low_runner_up) = strongest(&energies[..4]);
        let (high_idx, high_power, high_runner_up) = strongest(&energies[4..]);

        let total: f32 = energies.iter().sum();
        let pair = low_power + high_power;
        let confidence = pair / (total - pair).max(POWER_EPSILON);

        let above_floor = low_power > self.min_tone_power && high_power > self.min_tone_power;
        let separated = low_power >= low_runner_up * self.separation_ratio
            && high_power >= high_runner_up * self.separation_ratio
            && confidence >= self.separation_ratio;
        let twist = low_power.max(high_power) / low_power.min(high_power).max(POWER_EPSILON);
        let balanced = twist <= self.max_twist_ratio;

        let key = if above_floor && separated && balanced {
            Some(KEYPAD[low_idx][high_idx])
        } else {
            None
        };

        DigitEvent {
            key,
            confidence,
            energies,
        }
    }

    /// Feeds one frame; returns a key once it has been held long enough.
    ///
    /// A confirmed key re-arms only after at least one frame with no key, so a
    /// sustained tone registers once.
    pub fn process(&mut self, frame: &[f32], now: Duration) -> Option<DtmfKey> {
        let n = frame.len().min(DTMF_WINDOW);
        self.window.copy_within(n.., 0);
        let tail = DTMF_WINDOW - n;
        self.window[tail..].copy_from_slice(&frame[frame.len() - n..]);

        let event = self.classify(&self.window);
        match event.key {
            None => {
                self.candidate = None;
                self.armed = true;
                None
            }
            Some(key) => {
                if self.candidate != Some(key) {
                    self.candidate = Some(key);
                    self.candidate_since = now;
                }
                if self.armed && now.saturating_sub(self.candidate_since) >= self.hold {
                    self.armed = false;
                    log::debug!("DTMF key {} (confidence {:.1})", key, event.confidence);
                    return Some(key);
                }
                None
            }
        }
    }

    pub fn reset(&mut self) {
        self.window.fill(0.0);
        self.candidate = None;
        self.armed = true;
    }
}

/// Renders a DTMF key as a dual tone; used for loopback testing and by tools.
pub fn tone_pair(key: DtmfKey, amplitude: f32, samples: usize, start: usize) -> Vec<f32> {
    let (low, high) = key.frequencies();
    let rate = SAMPLE_RATE as f32;
    (start..start + samples)
        .map(|i| {
            let t = i as f32 / rate;
            amplitude * ((2.0 * PI * low * t).sin() + (2.0 * PI * high * t).sin())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FRAME_SIZE;

    fn decoder() -> DtmfDecoder {
        DtmfDecoder::new(&DtmfConfig::default())
    }

    fn sine(freq: f32, amplitude: f32, samples: usize) -> Vec<f32> {
        (0..samples)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / SAMPLE_RATE as f32).sin())
            .collect()
    }

    #[test]
    fn test_key_char_roundtrip() {
        for c in "0123456789*#ABCD".chars() {
            assert_eq!(DtmfKey::from_char(c).unwrap().as_char(), c);
        }
        assert_eq!(DtmfKey::from_char('x'), None);
        assert_eq!(DtmfKey::Digit(5).frequencies(), (770.0, 1336.0));
        assert_eq!(DtmfKey::Pound.frequencies(), (941.0, 1477.0));
    }

    #[test]
    fn test_classify_every_key() {
        let decoder = decoder();
        for c in "0123456789*#ABCD".chars() {
            let key = DtmfKey::from_char(c).unwrap();
            let samples = tone_pair(key, 0.3, DTMF_WINDOW, 0);
            let event = decoder.classify(&samples);
            assert_eq!(event.key, Some(key), "key {} misread", c);
            assert!(event.confidence > 6.0);
        }
    }

    #[test]
    fn test_energy_scale_matches_amplitude() {
        let decoder = decoder();
        let event = decoder.classify(&sine(770.0, 0.5, DTMF_WINDOW));
        assert!((event.energies[1] - 0.25).abs() < 0.02, "got {}", event.energies[1]);
    }

    #[test]
    fn test_single_tone_is_rejected() {
        let decoder = decoder();
        for freq in LOW_FREQS.iter().chain(HIGH_FREQS.iter()) {
            let event = decoder.classify(&sine(*freq, 0.5, DTMF_WINDOW));
            assert_eq!(event.key, None, "{} Hz alone produced a key", freq);
        }
    }

    #[test]
    fn test_quiet_pair_below_noise_floor() {
        let decoder = decoder();
        let samples = tone_pair(DtmfKey::Digit(1), 0.002, DTMF_WINDOW, 0);
        assert_eq!(decoder.classify(&samples).key, None);
    }

    #[test]
    fn test_excessive_twist_rejected() {
        let decoder = decoder();
        let low = sine(770.0, 0.5, DTMF_WINDOW);
        let high = sine(1336.0, 0.05, DTMF_WINDOW); // 20dB down
        let mixed: Vec<f32> = low.iter().zip(high.iter()).map(|(a, b)| a + b).collect();
        assert_eq!(decoder.classify(&mixed).key, None);
    }

    #[test]
    fn test_debounce_confirms_once_per_press() {
        let mut decoder = decoder();
        let mut now = Duration::ZERO;
        let mut confirmed = Vec::new();
        let tone = tone_pair(DtmfKey::Digit(5), 0.3, FRAME_SIZE * 20, 0);
        for frame in tone.chunks(FRAME_SIZE) {
            now += Duration::from_millis(10);
            if let Some(key) = decoder.process(frame, now) {
                confirmed.push(key);
            }
        }
        assert_eq!(confirmed, vec![DtmfKey::Digit(5)]);
    }

    #[test]
    fn test_short_blip_not_confirmed() {
        let mut decoder = decoder();
        let mut now = Duration::ZERO;
        let tone = tone_pair(DtmfKey::Digit(8), 0.3, FRAME_SIZE, 0);
        now += Duration::from_millis(10);
        assert_eq!(decoder.process(&tone, now), None);
        for _ in 0..10 {
            now += Duration::from_millis(10);
            assert_eq!(decoder.process(&[0.0; FRAME_SIZE], now), None);
        }
    }

    #[test]
    fn test_reset_clears_window() {
        let mut decoder = decoder();
        let tone = tone_pair(DtmfKey::Digit(2), 0.3, FRAME_SIZE * 4, 0);
        let mut now = Duration::ZERO;
        for frame in tone.chunks(FRAME_SIZE) {
            now += Duration::from_millis(10);
            decoder.process(frame, now);
        }
        decoder.reset();
        assert!(decoder.window.iter().all(|&s| s == 0.0));
        assert_eq!(decoder.candidate, None);
    }
}
