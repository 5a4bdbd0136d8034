use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cpal::traits::{DeviceTrait, HostTrait};
use crossbeam_channel::Sender;
use repeater_core::{Control, RepeaterCore, RepeaterEvent, RepeaterMode};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

mod announcer;
mod audio;
mod config;
mod keyline;
mod morse;
mod recorder;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "repeater")]
#[command(about = "Software repeater controller for amateur radio", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio devices
    List,
    /// Run the repeater in the foreground (press Ctrl+C to stop)
    Run {
        #[arg(short, long)]
        input: Option<String>,
        #[arg(short, long)]
        output: Option<String>,
        /// manual, timed-replay, delay-line or repeater
        #[arg(short, long)]
        mode: Option<RepeaterMode>,
        #[arg(long)]
        callsign: Option<String>,
    },
    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    ShowConfig,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Some(Commands::List) => {
            list_devices()?;
        }
        Some(Commands::Run {
            input,
            output,
            mode,
            callsign,
        }) => {
            let mut config = AppConfig::load(config_path);
            if let Some(input) = input {
                config.input_device = input;
            }
            if let Some(output) = output {
                config.output_device = output;
            }
            if let Some(mode) = mode {
                config.repeater.mode = mode;
            }
            if let Some(callsign) = callsign {
                config.callsign = callsign;
            }
            run(config)?;
        }
        Some(Commands::InitConfig { force }) => {
            let path = match config_path {
                Some(path) => path.to_path_buf(),
                None => config::config_path().context("No configuration directory available")?,
            };
            if path.exists() && !force {
                println!("{} already exists (use --force to overwrite)", path.display());
            } else {
                let written = AppConfig::default().save(Some(&path))?;
                println!("Wrote {}", written.display());
            }
        }
        Some(Commands::ShowConfig) => {
            let config = AppConfig::load(config_path);
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        None => {
            println!("Use 'repeater run' to start, or 'repeater --help' for more.");
        }
    }

    Ok(())
}

fn run(config: AppConfig) -> Result<()> {
    let repeater_config = config.repeater.normalized();
    let mode = repeater_config.mode;

    // The key line reports async faults through the core's control queue,
    // which only exists once the core does.
    let (fault_tx, fault_rx) = crossbeam_channel::bounded::<Control>(8);
    let key_line = keyline::build(&config.key_line, fault_tx)?;
    let (mut core, handle) = RepeaterCore::new(repeater_config, key_line);
    forward_controls(fault_rx, handle.control.clone())?;

    let saver = if config.recordings.enabled {
        let dir = config
            .recordings
            .resolved_dir()
            .context("No directory available for recordings")?;
        Some(recorder::RecordingSaver::spawn(dir, core.recordings())?)
    } else {
        None
    };

    let _announcer = announcer::Announcer::spawn(&config, handle.requests, handle.ready)?;
    let mut engine = audio::AudioEngine::start(&config.input_device, &config.output_device, core)?;

    println!(
        "Repeater active ({}, {}). Press Ctrl+C to stop.",
        mode, config.callsign
    );
    if mode == RepeaterMode::Manual {
        println!("Type 'start' / 'stop' to record and replay, 'id' to identify.");
    } else {
        println!("Type 'id' to identify.");
    }
    spawn_console(handle.control.clone())?;

    // Graceful shutdown handling
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        println!("\nShutting down gracefully...");
        r.store(false, Ordering::Relaxed);
    })?;

    while running.load(Ordering::Relaxed) && engine.is_alive() {
        for event in handle.events.try_iter() {
            report(&event);
        }
        thread::sleep(Duration::from_millis(100));
    }

    // Joins the processing thread, which unkeys before returning.
    engine.stop();
    if let Some(saver) = saver {
        saver.finish();
    }
    for event in handle.events.try_iter() {
        report(&event);
    }
    println!("Repeater stopped.");
    Ok(())
}

fn report(event: &RepeaterEvent) {
    match event {
        RepeaterEvent::StateChanged { from, to } => println!("[state] {} -> {}", from, to),
        RepeaterEvent::Keyed => println!("[ptt] on air"),
        RepeaterEvent::Unkeyed => println!("[ptt] off air"),
        RepeaterEvent::Timeout => println!("[ptt] TIMEOUT, transmitter dropped"),
        RepeaterEvent::KeyingFault(reason) => println!("[ptt] FAULT: {}", reason),
        RepeaterEvent::CommandDispatched(code) => println!("[dtmf] command {}", code),
        RepeaterEvent::RecordingFinished(length) => {
            println!("[rec] {:.1}s recorded", length.as_secs_f32())
        }
        RepeaterEvent::Identified => println!("[id] identified"),
        other => log::debug!("{:?}", other),
    }
}

fn forward_controls(
    from: crossbeam_channel::Receiver<Control>,
    to: Sender<Control>,
) -> Result<()> {
    thread::Builder::new()
        .name("repeater-faults".into())
        .spawn(move || {
            for control in from {
                if to.send(control).is_err() {
                    break;
                }
            }
        })
        .context("Failed to spawn fault forwarding thread")?;
    Ok(())
}

/// Reads operator commands from stdin.
fn spawn_console(control: Sender<Control>) -> Result<()> {
    thread::Builder::new()
        .name("repeater-console".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                let message = match line.trim().to_ascii_lowercase().as_str() {
                    "start" => Control::ManualStart,
                    "stop" => Control::ManualStop,
                    "id" => Control::Identify,
                    "" => continue,
                    other => {
                        println!("Unknown command '{}'", other);
                        continue;
                    }
                };
                if control.send(message).is_err() {
                    break;
                }
            }
        })
        .context("Failed to spawn console thread")?;
    Ok(())
}

fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    println!("Audio Host: {}", host.id().name());
    println!("\nInput Devices:");
    for device in host.input_devices()? {
        println!("  - {}", device.name().unwrap_or("Unknown".to_string()));
    }
    println!("\nOutput Devices:");
    for device in host.output_devices()? {
        println!("  - {}", device.name().unwrap_or("Unknown".to_string()));
    }
    Ok(())
}
