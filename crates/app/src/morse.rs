//! Morse code rendering for station ID and command responses.

use log::debug;
use repeater_core::constants::samples_for;
use repeater_core::tone::{ToneGen, FADE};
use std::time::Duration;

/// Dot/dash pattern for a character, `None` when Morse has no symbol for it.
pub fn pattern(c: char) -> Option<&'static str> {
    let p = match c.to_ascii_uppercase() {
        'A' => ".-",
        'B' => "-...",
        'C' => "-.-.",
        'D' => "-..",
        'E' => ".",
        'F' => "..-.",
        'G' => "--.",
        'H' => "....",
        'I' => "..",
        'J' => ".---",
        'K' => "-.-",
        'L' => ".-..",
        'M' => "--",
        'N' => "-.",
        'O' => "---",
        'P' => ".--.",
        'Q' => "--.-",
        'R' => ".-.",
        'S' => "...",
        'T' => "-",
        'U' => "..-",
        'V' => "...-",
        'W' => ".--",
        'X' => "-..-",
        'Y' => "-.--",
        'Z' => "--..",
        '0' => "-----",
        '1' => ".----",
        '2' => "..---",
        '3' => "...--",
        '4' => "....-",
        '5' => ".....",
        '6' => "-....",
        '7' => "--...",
        '8' => "---..",
        '9' => "----.",
        '/' => "-..-.",
        '?' => "..--..",
        '.' => ".-.-.-",
        ',' => "--..--",
        '=' => "-...-",
        _ => return None,
    };
    Some(p)
}

/// Renders text as keyed sine audio using PARIS timing.
pub struct MorseRenderer {
    dot: usize,
    freq_hz: f32,
    volume: f32,
}

impl MorseRenderer {
    pub fn new(wpm: u32, freq_hz: f32, volume: f32) -> Self {
        let wpm = wpm.clamp(5, 60);
        // PARIS: one dot is 1.2 s / wpm
        let dot = samples_for(Duration::from_micros(1_200_000 / wpm as u64));
        Self {
            dot,
            freq_hz,
            volume: volume.clamp(0.0, 1.0),
        }
    }

    pub fn dot_samples(&self) -> usize {
        self.dot
    }

    /// Renders `text`. Unknown characters are skipped; runs of whitespace
    /// become one word gap. The result ends after the trailing fade.
    pub fn render(&self, text: &str) -> Vec<f32> {
        let mut gen = ToneGen::new(self.freq_hz, self.volume, FADE);
        let mut out = Vec::new();
        let mut pending_gap = 0;

        for word in text.split_whitespace() {
            if !out.is_empty() {
                pending_gap = 7;
            }
            for c in word.chars() {
                let Some(symbols) = pattern(c) else {
                    debug!("No Morse symbol for {:?}", c);
                    continue;
                };
                if pending_gap == 0 && !out.is_empty() {
                    pending_gap = 3;
                }
                gen.render_into(&mut out, false, pending_gap * self.dot);
                pending_gap = 0;

                for (i, symbol) in symbols.chars().enumerate() {
                    if i > 0 {
                        gen.render_into(&mut out, false, self.dot);
                    }
                    let units = if symbol == '-' { 3 } else { 1 };
                    gen.render_into(&mut out, true, units * self.dot);
                }
            }
        }

        if !out.is_empty() {
            gen.render_into(&mut out, false, samples_for(FADE) + 1);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repeater_core::constants::SAMPLE_RATE;

    fn keyed_runs(audio: &[f32]) -> usize {
        let mut runs = 0;
        let mut in_tone = false;
        let mut quiet = 0;
        for s in audio {
            if s.abs() > 1e-6 {
                if !in_tone {
                    runs += 1;
                }
                in_tone = true;
                quiet = 0;
            } else {
                quiet += 1;
                // A single zero crossing is not a gap
                if quiet > 4 {
                    in_tone = false;
                }
            }
        }
        runs
    }

    #[test]
    fn test_pattern_table() {
        assert_eq!(pattern('s'), Some("..."));
        assert_eq!(pattern('O'), Some("---"));
        assert_eq!(pattern('0'), Some("-----"));
        assert_eq!(pattern('#'), None);
    }

    #[test]
    fn test_dot_length_at_20_wpm() {
        let renderer = MorseRenderer::new(20, 800.0, 0.5);
        assert_eq!(renderer.dot_samples(), SAMPLE_RATE as usize * 60 / 1000);
    }

    #[test]
    fn test_render_element_count() {
        let renderer = MorseRenderer::new(20, 800.0, 0.5);
        // S = 3 dots, O = 3 dashes
        assert_eq!(keyed_runs(&renderer.render("SOS")), 9);
        assert_eq!(keyed_runs(&renderer.render("DE N0CALL")), 3 + 1 + 2 + 5 + 4 + 2 + 4 + 4);
    }

    #[test]
    fn test_render_length() {
        let renderer = MorseRenderer::new(20, 800.0, 0.5);
        let dot = renderer.dot_samples();
        let tail = samples_for(FADE) + 1;
        // E = 1 unit; "E E" = 1 + 7 + 1
        assert_eq!(renderer.render("E").len(), dot + tail);
        assert_eq!(renderer.render("E E").len(), 9 * dot + tail);
        // T = 3 units; "ET" = 1 + 3 + 3
        assert_eq!(renderer.render("ET").len(), 7 * dot + tail);
        assert!(renderer.render("").is_empty());
        assert!(renderer.render("###").is_empty());
    }

    #[test]
    fn test_ends_in_silence() {
        let audio = MorseRenderer::new(25, 700.0, 0.8).render("QTR 1234 Z");
        assert!(audio.iter().all(|s| s.abs() <= 0.8));
        assert_eq!(*audio.last().unwrap(), 0.0);
    }
}
