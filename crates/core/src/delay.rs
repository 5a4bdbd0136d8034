//! Fixed-length delay line over a ring buffer.
//!
//! Every frame pushed in pushes exactly one frame out, delayed by the
//! configured length. Used as the pre-key look-ahead (so the leading edge of
//! the triggering audio survives until the transmitter is up), as the
//! pre-roll of the recording modes, and as the continuous delay line itself.

use crate::constants::FRAME_SIZE;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

pub struct DelayLine {
    rb: HeapRb<f32>,
    delay: usize,
}

impl DelayLine {
    /// Creates a line holding `delay` samples of silence.
    pub fn new(delay: usize) -> Self {
        let mut line = Self {
            rb: HeapRb::<f32>::new(delay + FRAME_SIZE * 2),
            delay,
        };
        line.fill_silence();
        line
    }

    pub fn delay(&self) -> usize {
        self.delay
    }

    /// Pushes `input` and writes the samples falling out of the line into
    /// `output`. `output` must be as long as `input`.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        for (&sample, out) in input.iter().zip(output.iter_mut()) {
            let _ = self.rb.try_push(sample);
            *out = if self.rb.occupied_len() > self.delay {
                self.rb.try_pop().unwrap_or(0.0)
            } else {
                0.0
            };
        }
    }

    /// Moves the whole delayed contents (oldest first) into `out` and
    /// refills the line with silence.
    pub fn flush_into(&mut self, out: &mut impl Extend<f32>) {
        out.extend(self.rb.pop_iter());
        self.fill_silence();
    }

    /// Copies the most recent `samples` samples without consuming them.
    pub fn copy_recent(&self, samples: usize, out: &mut Vec<f32>) {
        let len = self.rb.occupied_len();
        out.extend(self.rb.iter().skip(len.saturating_sub(samples)));
    }

    /// Discards the contents and refills with silence.
    pub fn reset(&mut self) {
        self.rb.clear();
        self.fill_silence();
    }

    /// Changes the delay; contents are discarded.
    pub fn resize(&mut self, delay: usize) {
        if delay != self.delay {
            *self = Self::new(delay);
        }
    }

    fn fill_silence(&mut self) {
        while self.rb.occupied_len() < self.delay {
            let _ = self.rb.try_push(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|i| i as f32).collect()
    }

    #[test]
    fn test_output_is_delayed_input() {
        let delay = FRAME_SIZE * 3 + 17;
        let mut line = DelayLine::new(delay);
        let mut outputs = Vec::new();
        let mut out = [0.0f32; FRAME_SIZE];
        for frame in 0..10 {
            line.process(&ramp(frame * FRAME_SIZE + 1, FRAME_SIZE), &mut out);
            outputs.extend_from_slice(&out);
        }
        assert!(outputs[..delay].iter().all(|s| *s == 0.0));
        assert_eq!(outputs[delay], 1.0);
        assert_eq!(outputs[delay + 100], 101.0);
    }

    #[test]
    fn test_flush_returns_pending_audio() {
        let mut line = DelayLine::new(FRAME_SIZE * 2);
        let mut out = [0.0f32; FRAME_SIZE];
        for frame in 0..4 {
            line.process(&ramp(frame * FRAME_SIZE, FRAME_SIZE), &mut out);
        }
        let mut pending = Vec::new();
        line.flush_into(&mut pending);
        assert_eq!(pending, ramp(FRAME_SIZE * 2, FRAME_SIZE * 2));

        // The line keeps its length after a flush.
        line.process(&ramp(0, FRAME_SIZE), &mut out);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_copy_recent() {
        let mut line = DelayLine::new(FRAME_SIZE);
        let mut out = [0.0f32; FRAME_SIZE];
        line.process(&ramp(0, FRAME_SIZE), &mut out);
        let mut recent = Vec::new();
        line.copy_recent(10, &mut recent);
        assert_eq!(recent, ramp(FRAME_SIZE - 10, 10));
    }
}
