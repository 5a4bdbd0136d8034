//! Shared constants for the repeater audio pipeline.

use std::time::Duration;

/// Sample rate used throughout the pipeline (48kHz)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame size in samples (10ms at 48kHz = 480 samples)
pub const FRAME_SIZE: usize = 480;

/// Wall-clock length of one frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(10);

/// DTMF analysis window (40ms, 25Hz Goertzel resolution)
pub const DTMF_WINDOW: usize = FRAME_SIZE * 4;

/// Longest command code the assembler accepts.
pub const MAX_COMMAND_DIGITS: usize = 4;

/// Converts a duration to a whole number of samples at `SAMPLE_RATE`.
pub fn samples_for(duration: Duration) -> usize {
    (duration.as_secs_f64() * SAMPLE_RATE as f64).round() as usize
}

/// Session time at the start of frame number `frames`.
pub fn frame_time(frames: u64) -> Duration {
    Duration::from_nanos(frames.saturating_mul(FRAME_DURATION.as_nanos() as u64))
}
