//! Hearamp - personal hearing amplifier
//!
//! Runs the microphone through the fitted processing chain into the
//! earpiece, controlled from the terminal.
//!
//! ## Usage
//!
//! ```text
//! hearamp [--config <file>]                  live amplification
//! hearamp --list-devices                     show audio devices
//! hearamp [--config <file>] process <in.wav> <out.wav>
//! ```
//!
//! Live commands (type + Enter): `m` mute, `+`/`-` volume, `f` feedback
//! suppression, `s` suspend/resume, `r` restart, `t` telemetry, `w` save
//! config, `q` quit.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam::channel::{Receiver, RecvTimeoutError};

use hearamp_core::audio::{get_devices, CpalBackend, Direction};
use hearamp_core::config::{self, HearampConfig};
use hearamp_core::engine::{render_wav, AudioEngine, EngineEvent, EngineState, TelemetryEvent};

/// How often the engine is serviced while idle
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How often a telemetry summary is logged
const REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Master gain step for `+` / `-`
const GAIN_STEP_DB: f32 = 3.0;

enum Command {
    Live,
    ListDevices,
    Process { input: PathBuf, output: PathBuf },
}

struct Args {
    config_path: PathBuf,
    command: Command,
}

fn parse_args() -> Result<Args> {
    let mut config_path = config::default_path();
    let mut command = Command::Live;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = args.next().map(PathBuf::from).context("--config needs a file path")?;
            }
            "--list-devices" => command = Command::ListDevices,
            "process" => {
                let input = args.next().map(PathBuf::from).context("process needs an input WAV")?;
                let output = args.next().map(PathBuf::from).context("process needs an output WAV")?;
                command = Command::Process { input, output };
            }
            "--help" | "-h" => {
                println!("usage: hearamp [--config <file>] [--list-devices | process <in.wav> <out.wav>]");
                std::process::exit(0);
            }
            other => bail!("Unknown argument: {}", other),
        }
    }
    Ok(Args { config_path, command })
}

fn main() -> Result<()> {
    // Set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = parse_args()?;
    log::info!("hearamp starting up");

    match args.command {
        Command::ListDevices => list_devices(),
        Command::Process { input, output } => {
            let config: HearampConfig = config::load_config(&args.config_path);
            let rendered = render_wav(&config, &input, &output)?;
            println!(
                "Rendered {} samples: {} limiter engagements, {} feedback detections",
                rendered.samples.len(),
                rendered.telemetry.limiter_engagements,
                rendered.telemetry.feedback_detections
            );
            Ok(())
        }
        Command::Live => run_live(&args.config_path),
    }
}

fn list_devices() -> Result<()> {
    for direction in [Direction::Input, Direction::Output] {
        println!("{:?} devices:", direction);
        match get_devices(direction) {
            Ok(devices) => {
                for device in devices {
                    println!(
                        "  {} - {} ch, {:?} Hz",
                        device, device.max_channels, device.sample_rates
                    );
                }
            }
            Err(e) => println!("  ({})", e),
        }
    }
    Ok(())
}

/// Read stdin lines on a helper thread so the control loop never blocks
fn spawn_stdin_reader() -> Result<Receiver<String>> {
    let (tx, rx) = crossbeam::channel::unbounded();
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("Failed to spawn stdin reader")?;
    Ok(rx)
}

fn run_live(config_path: &Path) -> Result<()> {
    let config: HearampConfig = config::load_config(config_path);
    let mut engine = AudioEngine::new(CpalBackend::new(), config).context("Failed to create audio engine")?;
    let events = engine.subscribe();
    engine.start().context("Failed to start audio engine")?;

    println!("Hearamp running. Commands: m mute, +/- volume, f feedback, s suspend, r restart, t stats, w save, q quit");
    let input = spawn_stdin_reader()?;
    let mut muted = false;
    let mut last_report = Instant::now();

    loop {
        match input.recv_timeout(POLL_INTERVAL) {
            Ok(line) => {
                let keep_running = handle_command(line.trim(), &mut engine, &mut muted, config_path);
                if !keep_running {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            // stdin closed: keep amplifying until interrupted
            Err(RecvTimeoutError::Disconnected) => std::thread::sleep(POLL_INTERVAL),
        }

        engine.poll();
        for event in events.try_iter() {
            log_event(&event);
        }

        if last_report.elapsed() >= REPORT_INTERVAL {
            report(&engine);
            last_report = Instant::now();
        }
    }

    if matches!(engine.state(), EngineState::Running | EngineState::Suspended) {
        engine.stop()?;
    }
    report(&engine);
    Ok(())
}

/// Returns false when the user asked to quit
fn handle_command(command: &str, engine: &mut AudioEngine<CpalBackend>, muted: &mut bool, config_path: &Path) -> bool {
    let result = match command {
        "q" | "quit" => return false,
        "m" => {
            *muted = !*muted;
            engine.set_muted(*muted);
            println!("{}", if *muted { "Muted" } else { "Unmuted" });
            Ok(())
        }
        "+" | "-" => {
            let step = if command == "+" { GAIN_STEP_DB } else { -GAIN_STEP_DB };
            let gain = engine.config().master_gain_db + step;
            engine
                .set_master_gain_db(gain)
                .map(|_| println!("Master gain {:+.1} dB", gain))
                .map_err(anyhow::Error::from)
        }
        "f" => {
            let enabled = !engine.parameters().feedback_enabled;
            engine.set_feedback_enabled(enabled);
            println!("Feedback suppression {}", if enabled { "on" } else { "off" });
            Ok(())
        }
        "s" => match engine.state() {
            EngineState::Suspended => engine.resume().map_err(anyhow::Error::from),
            _ => engine.suspend().map_err(anyhow::Error::from),
        },
        "r" => engine.restart().map_err(anyhow::Error::from),
        "t" => {
            report(engine);
            Ok(())
        }
        "w" => config::save_config(engine.config(), config_path),
        "" => Ok(()),
        other => {
            println!("Unknown command: {}", other);
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
    }
    true
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::StateChanged { from, to } => log::info!("State {} -> {}", from, to),
        EngineEvent::Error { message, transient } => {
            if *transient {
                log::warn!("Device error (retrying): {}", message)
            } else {
                log::error!("Device error: {}", message)
            }
        }
        EngineEvent::Reconnecting { attempt, delay_ms } => {
            log::info!("Reconnect attempt {} in {} ms", attempt, delay_ms)
        }
        EngineEvent::StreamOpened {
            sample_rate,
            frame_size,
            estimated_latency_ms,
        } => log::info!(
            "Stream opened: {} Hz, {} samples/frame, ~{:.1} ms",
            sample_rate,
            frame_size,
            estimated_latency_ms
        ),
        EngineEvent::Telemetry(TelemetryEvent::FeedbackDetected { channel, frequency_hz }) => {
            log::warn!("Feedback on channel {} at {:.0} Hz", channel, frequency_hz)
        }
        EngineEvent::Telemetry(TelemetryEvent::FeedbackUnresolved {
            channel,
            frequency_hz,
            band,
            reduction_db,
        }) => log::warn!(
            "Feedback at {:.0} Hz persists on channel {}: band {} reduced by {:.1} dB",
            frequency_hz,
            channel,
            band,
            -reduction_db
        ),
        EngineEvent::Telemetry(event) => log::debug!("{:?}", event),
    }
}

fn report(engine: &AudioEngine<CpalBackend>) {
    let t = engine.telemetry();
    log::info!(
        "{} | latency {:.1} ms | frames {} | xruns in {}/{} out {}/{} | trimmed {} | limiter {} | feedback {} ({} unresolved)",
        engine.state(),
        t.latency_ms(),
        t.frames_processed,
        t.capture_underruns,
        t.capture_overruns,
        t.playback_underruns,
        t.playback_overruns,
        t.trimmed_samples,
        t.limiter_engagements,
        t.feedback_detections,
        t.feedback_unresolved
    );
}
