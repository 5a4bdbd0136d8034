//! Frame loudness metering.

/// Root-mean-square amplitude of a frame. Empty frames are silent.
pub fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f32 = frame.iter().map(|x| x * x).sum();
    (sum / frame.len() as f32).sqrt()
}

/// Normalized loudness in [0, 1]: RMS scaled by the input gain, full scale = 1.0.
pub fn loudness(frame: &[f32], input_gain: f32) -> f32 {
    (rms(frame) * input_gain).clamp(0.0, 1.0)
}

/// Applies a gain in place, clipping to full scale.
pub fn apply_gain(frame: &mut [f32], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in frame.iter_mut() {
        *sample = (*sample * gain).clamp(-1.0, 1.0);
    }
}
