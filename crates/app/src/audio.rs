use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{info, warn};
use repeater_core::constants::{frame_time, FRAME_SIZE, SAMPLE_RATE};
use repeater_core::RepeaterCore;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Moves audio between the sound card and the repeater core.
///
/// The processing thread owns the core and advances its clock by one frame
/// per processed frame, so session time follows the audio clock.
pub struct AudioEngine {
    _input_stream: cpal::Stream,
    _output_stream: cpal::Stream,
    is_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

fn find_device(host: &cpal::Host, name: &str, input: bool) -> Result<cpal::Device> {
    let kind = if input { "input" } else { "output" };
    if name == "default" {
        let device = if input {
            host.default_input_device()
        } else {
            host.default_output_device()
        };
        return device.with_context(|| format!("No default {} found", kind));
    }
    let mut devices = if input {
        host.input_devices()?
    } else {
        host.output_devices()?
    };
    devices
        .find(|d| d.name().ok().as_deref() == Some(name))
        .with_context(|| format!("{} device '{}' not found", kind, name))
}

impl AudioEngine {
    pub fn start(input_device_name: &str, output_device_name: &str, mut core: RepeaterCore) -> Result<Self> {
        let host = cpal::default_host();
        info!("Audio host: {}", host.id().name());

        let input_device = find_device(&host, input_device_name, true)?;
        info!(
            "Using input device: {}",
            input_device.name().unwrap_or_default()
        );
        let output_device = find_device(&host, output_device_name, false)?;
        info!(
            "Using output device: {}",
            output_device.name().unwrap_or_default()
        );

        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        // 100ms of buffering each way
        let buffer_size = (SAMPLE_RATE as usize) / 10;

        let rb_in = HeapRb::<f32>::new(buffer_size);
        let (mut prod_in, mut cons_in) = rb_in.split();

        let rb_out = HeapRb::<f32>::new(buffer_size);
        let (mut prod_out, mut cons_out) = rb_out.split();

        let input_stream = input_device
            .build_input_stream(
                &config,
                move |data: &[f32], _| {
                    let _ = prod_in.push_slice(data);
                },
                |err| warn!("Input error: {}", err),
                None,
            )
            .context("Failed to open input stream")?;

        let output_stream = output_device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _| {
                    let read = cons_out.pop_slice(data);
                    if read < data.len() {
                        for sample in data.iter_mut().skip(read) {
                            *sample = 0.0;
                        }
                    }
                },
                |err| warn!("Output error: {}", err),
                None,
            )
            .context("Failed to open output stream")?;

        let is_running = Arc::new(AtomicBool::new(true));
        let run_flag = is_running.clone();

        let thread = thread::Builder::new()
            .name("repeater-audio".into())
            .spawn(move || {
                let mut input_frame = [0.0f32; FRAME_SIZE];
                let mut output_frame = [0.0f32; FRAME_SIZE];
                let mut frames: u64 = 0;

                while run_flag.load(Ordering::Relaxed) && !core.is_stopped() {
                    if cons_in.occupied_len() < FRAME_SIZE {
                        thread::sleep(Duration::from_micros(200));
                        continue;
                    }
                    cons_in.pop_slice(&mut input_frame);
                    core.process_frame(&input_frame, &mut output_frame, frame_time(frames));
                    frames += 1;

                    // Retry briefly if the output buffer is full
                    let mut retries = 0;
                    while prod_out.vacant_len() < FRAME_SIZE {
                        thread::yield_now();
                        retries += 1;
                        if retries > 100 {
                            break;
                        }
                    }
                    if prod_out.vacant_len() >= FRAME_SIZE {
                        prod_out.push_slice(&output_frame);
                    } else {
                        log::trace!("Output buffer full, frame dropped");
                    }
                }
                core.shutdown(frame_time(frames));
                info!("Audio processing stopped");
            })
            .context("Failed to spawn audio processing thread")?;

        input_stream.play()?;
        output_stream.play()?;

        Ok(Self {
            _input_stream: input_stream,
            _output_stream: output_stream,
            is_running,
            thread: Some(thread),
        })
    }

    /// Whether the processing thread is still running.
    pub fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops processing and waits until the core has unkeyed.
    pub fn stop(&mut self) {
        self.is_running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio processing thread panicked");
            }
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
