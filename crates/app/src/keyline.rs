//! Transmitter keying backends.

use crate::config::{KeyLineConfig, KeyLineKind};
use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Sender, TrySendError};
use log::{error, info, warn};
use repeater_core::{Control, KeyLine};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};

pub fn build(config: &KeyLineConfig, control: Sender<Control>) -> Result<Box<dyn KeyLine>> {
    match config.kind {
        KeyLineKind::None => Ok(Box::new(NoKeyLine)),
        KeyLineKind::Command => Ok(Box::new(CommandKeyLine::spawn(
            config.key_on.clone(),
            config.key_off.clone(),
            control,
        )?)),
    }
}

/// Logs transitions only; the radio keys itself from the audio.
pub struct NoKeyLine;

impl KeyLine for NoKeyLine {
    fn set_keyed(&mut self, keyed: bool) -> Result<()> {
        info!("PTT {}", if keyed { "ON" } else { "OFF" });
        Ok(())
    }
}

/// Runs an external program per transition on a dedicated keying thread.
///
/// `set_keyed` only queues the transition; a failed program is reported
/// back to the core as `Control::KeyingFault`.
pub struct CommandKeyLine {
    tx: Option<Sender<bool>>,
    thread: Option<JoinHandle<()>>,
}

impl CommandKeyLine {
    pub fn spawn(key_on: Vec<String>, key_off: Vec<String>, control: Sender<Control>) -> Result<Self> {
        if key_on.is_empty() || key_off.is_empty() {
            bail!("Command key line needs both key_on and key_off programs");
        }
        let (tx, rx) = bounded::<bool>(8);

        let thread = thread::Builder::new()
            .name("repeater-keyline".into())
            .spawn(move || {
                // Exits once the sender is dropped and the queue is drained.
                for keyed in rx {
                    let argv = if keyed { &key_on } else { &key_off };
                    if let Err(e) = run(argv) {
                        error!("Keying command failed: {:#}", e);
                        report_fault(&control, format!("{:#}", e));
                    }
                }
            })
            .context("Failed to spawn keying thread")?;

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }
}

/// Returns false when the fault could not be delivered to the core.
fn report_fault(control: &Sender<Control>, reason: String) -> bool {
    match control.try_send(Control::KeyingFault(reason)) {
        Ok(()) => true,
        Err(TrySendError::Full(Control::KeyingFault(reason))) => {
            error!("Control queue full, keying fault not delivered: {}", reason);
            false
        }
        Err(TrySendError::Full(_)) => false,
        Err(TrySendError::Disconnected(_)) => {
            warn!("Core gone, keying fault dropped");
            false
        }
    }
}

fn run(argv: &[String]) -> Result<()> {
    let (program, args) = argv.split_first().context("Empty keying command")?;
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .status()
        .with_context(|| format!("Failed to run {}", program))?;
    if !status.success() {
        bail!("{} exited with {}", program, status);
    }
    Ok(())
}

impl KeyLine for CommandKeyLine {
    fn set_keyed(&mut self, keyed: bool) -> Result<()> {
        let Some(tx) = &self.tx else {
            bail!("Keying thread stopped");
        };
        match tx.try_send(keyed) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => bail!("Keying thread not keeping up"),
            Err(TrySendError::Disconnected(_)) => bail!("Keying thread stopped"),
        }
    }
}

impl Drop for CommandKeyLine {
    fn drop(&mut self) {
        // Let a queued key-off run before the process exits.
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_none_key_line_always_succeeds() {
        let (control, _rx) = bounded(4);
        let mut line = build(&KeyLineConfig::default(), control).unwrap();
        assert!(line.set_keyed(true).is_ok());
        assert!(line.set_keyed(false).is_ok());
    }

    #[test]
    fn test_command_key_line_requires_programs() {
        let (control, _rx) = bounded(4);
        let config = KeyLineConfig {
            kind: KeyLineKind::Command,
            key_on: argv(&["true"]),
            key_off: vec![],
        };
        assert!(build(&config, control).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_program_reports_fault() {
        let (control, control_rx) = bounded(4);
        let mut line = CommandKeyLine::spawn(argv(&["false"]), argv(&["true"]), control).unwrap();
        line.set_keyed(true).unwrap();
        match control_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Control::KeyingFault(reason) => assert!(reason.contains("false")),
            other => panic!("unexpected control {:?}", other),
        }
        line.set_keyed(false).unwrap();
        drop(line);
        assert!(control_rx.try_recv().is_err());
    }

    #[test]
    fn test_fault_on_full_queue_is_not_delivered() {
        let (control, control_rx) = bounded(1);
        control.try_send(Control::Identify).unwrap();
        assert!(!report_fault(&control, "stuck".into()));
        assert!(matches!(control_rx.try_recv().unwrap(), Control::Identify));
        assert!(report_fault(&control, "stuck".into()));
        assert!(matches!(
            control_rx.try_recv().unwrap(),
            Control::KeyingFault(reason) if reason == "stuck"
        ));
    }

    #[test]
    fn test_missing_program_reports_fault() {
        let (control, control_rx) = bounded(4);
        let mut line = CommandKeyLine::spawn(
            argv(&["/nonexistent/ptt-helper"]),
            argv(&["/nonexistent/ptt-helper"]),
            control,
        )
        .unwrap();
        line.set_keyed(true).unwrap();
        assert!(matches!(
            control_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Control::KeyingFault(_)
        ));
    }
}
