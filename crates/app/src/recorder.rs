//! Saves replayed recordings as 16-bit mono WAV files.

use crate::announcer::unix_now;
use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use hound::{SampleFormat, WavSpec, WavWriter};
use log::{error, info};
use repeater_core::constants::SAMPLE_RATE;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

pub fn write_wav(path: &Path, samples: &[f32]) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = WavWriter::new(BufWriter::new(file), spec)?;
    for sample in samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Writes each recording the core publishes to `dir` on a worker thread.
/// The thread ends when the core drops its side of the queue.
pub struct RecordingSaver {
    thread: Option<JoinHandle<()>>,
}

impl RecordingSaver {
    pub fn spawn(dir: PathBuf, recordings: Receiver<Vec<f32>>) -> Result<Self> {
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        info!("Saving recordings to {}", dir.display());

        let thread = thread::Builder::new()
            .name("repeater-recorder".into())
            .spawn(move || {
                let mut sequence = 0u32;
                for recording in recordings {
                    sequence += 1;
                    let path = dir.join(format!("recording-{}-{}.wav", unix_now(), sequence));
                    match write_wav(&path, &recording) {
                        Ok(()) => info!("Recording saved to {}", path.display()),
                        Err(e) => error!("Failed to save recording: {:#}", e),
                    }
                }
            })
            .context("Failed to spawn recorder thread")?;

        Ok(Self {
            thread: Some(thread),
        })
    }
}

impl RecordingSaver {
    /// Waits for the last file. Call only after the core is dropped.
    pub fn finish(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Recorder thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("repeater-{}-{}", name, std::process::id()))
    }

    #[test]
    fn test_write_wav_scales_and_clamps() {
        let dir = temp_dir("wav");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("clip.wav");
        write_wav(&path, &[0.0, 0.5, -1.0, 2.0]).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, SAMPLE_RATE);
        assert_eq!(spec.bits_per_sample, 16);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 16383, -32767, 32767]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_saver_writes_each_recording() {
        let dir = temp_dir("saver");
        let (tx, rx) = bounded(4);
        let saver = RecordingSaver::spawn(dir.clone(), rx).unwrap();
        tx.send(vec![0.25; 480]).unwrap();
        tx.send(vec![-0.25; 960]).unwrap();
        drop(tx);
        saver.finish();

        let mut lengths: Vec<u32> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| hound::WavReader::open(e.unwrap().path()).unwrap().len())
            .collect();
        lengths.sort();
        assert_eq!(lengths, vec![480, 960]);
        let _ = fs::remove_dir_all(&dir);
    }
}
