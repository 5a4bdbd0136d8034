//! Background announcement worker.
//!
//! Receives `AnnouncementRequest`s from the core, renders them as Morse and
//! answers with `AnnouncementReady`. Rendering happens here so the
//! processing thread never allocates large buffers or touches the clock.

use crate::config::{AppConfig, CommandAction};
use crate::morse::MorseRenderer;
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use repeater_core::{AnnouncementKind, AnnouncementReady, AnnouncementRequest};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Resolves announcement requests to text.
pub struct Script {
    callsign: String,
    commands: BTreeMap<String, CommandAction>,
}

impl Script {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            callsign: config.callsign.trim().to_uppercase(),
            commands: config.commands.clone(),
        }
    }

    /// Text for `kind` at `unix_secs`, or `None` for an unmapped command.
    pub fn text_for(&self, kind: &AnnouncementKind, unix_secs: u64) -> Option<String> {
        match kind {
            AnnouncementKind::Identification => Some(self.identification()),
            AnnouncementKind::CommandResponse(code) => match self.commands.get(code)? {
                CommandAction::StationId => Some(self.identification()),
                CommandAction::Time => Some(utc_time_text(unix_secs)),
                CommandAction::Message(text) => Some(text.clone()),
            },
        }
    }

    fn identification(&self) -> String {
        format!("DE {}", self.callsign)
    }
}

/// "QTR HHMM Z" for the given UNIX time.
pub fn utc_time_text(unix_secs: u64) -> String {
    let minutes = unix_secs / 60;
    format!("QTR {:02}{:02} Z", (minutes / 60) % 24, minutes % 60)
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct Announcer {
    is_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Announcer {
    pub fn spawn(
        config: &AppConfig,
        requests: Receiver<AnnouncementRequest>,
        ready: Sender<AnnouncementReady>,
    ) -> Result<Self> {
        let script = Script::new(config);
        let renderer = MorseRenderer::new(config.morse_wpm, config.morse_tone_hz, config.morse_volume);
        let is_running = Arc::new(AtomicBool::new(true));
        let run_flag = is_running.clone();

        let thread = thread::Builder::new()
            .name("repeater-announcer".into())
            .spawn(move || {
                while run_flag.load(Ordering::Relaxed) {
                    let request = match requests.recv_timeout(Duration::from_millis(100)) {
                        Ok(request) => request,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    let audio = match script.text_for(&request.kind, unix_now()) {
                        Some(text) => {
                            info!("Announcing \"{}\"", text);
                            renderer.render(&text)
                        }
                        None => {
                            // Empty audio completes the request without playback.
                            warn!("No action for {:?}", request.kind);
                            Vec::new()
                        }
                    };
                    debug!("Announcement {} rendered ({} samples)", request.token, audio.len());
                    if ready
                        .send(AnnouncementReady {
                            token: request.token,
                            audio,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            })
            .context("Failed to spawn announcement thread")?;

        Ok(Self {
            is_running,
            thread: Some(thread),
        })
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
