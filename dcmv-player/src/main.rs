//! # DCMV Player
//!
//! Headless tick driver for DCMV containers. Frames go to a counting sink,
//! audio is pulled by a paced mixer thread, and the engine is steered with
//! JSON lines on stdin:
//!
//! ```text
//! {"cmd":"seek","frame":120}
//! {"cmd":"skip","frame":300}
//! {"cmd":"channel","channel":2,"enabled":false}
//! {"cmd":"stats"}
//! ```
//!
//! Replies and events are JSON lines on stdout; logs go to stderr.

use anyhow::Result;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dcmv_core::{
    AudioStreamSource, Control, Engine, EngineConfig, FileSource, NullSink, PlaybackState,
};

/// Display refresh the tick loop runs at.
const TICK_INTERVAL: Duration = Duration::from_millis(4);
/// Audio callback period of the mixer thread.
const MIX_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// Arguments
// ============================================================================

struct PlayerOptions {
    input: PathBuf,
    config: Option<PathBuf>,
    info_only: bool,
    exit_at_end: bool,
}

fn parse_args(args: &[String]) -> Result<PlayerOptions> {
    let mut input: Option<PathBuf> = None;
    let mut config = None;
    let mut info_only = false;
    let mut exit_at_end = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for --config"))?;
                config = Some(PathBuf::from(value));
                i += 2;
            }
            "--info" => {
                info_only = true;
                i += 1;
            }
            "--exit-at-end" => {
                exit_at_end = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other if !other.starts_with('-') && input.is_none() => {
                input = Some(PathBuf::from(other));
                i += 1;
            }
            other => {
                tracing::warn!("Ignoring unknown argument {}", other);
                i += 1;
            }
        }
    }

    let input = input.ok_or_else(|| {
        print_usage();
        anyhow::anyhow!("Missing input file")
    })?;

    Ok(PlayerOptions {
        input,
        config,
        info_only,
        exit_at_end,
    })
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  dcmv <file.dcmv> [--config <engine.json>] [--info] [--exit-at-end]\n"
    );
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Command {
    Play,
    Pause,
    Stop,
    Seek { frame: i64 },
    Skip { frame: i64 },
    StepBack,
    Channel { channel: u8, enabled: bool },
    Volume { volume: u8 },
    EndFrame { frame: Option<u32> },
    Frame,
    Info,
    Stats,
    Quit,
}

/// Apply one command. Returns the reply, or `None` for quit.
fn apply(command: Command, engine: &Engine, control: &Control) -> Option<Value> {
    let reply = match command {
        Command::Play => {
            control.play();
            json!({ "ok": true })
        }
        Command::Pause => {
            control.pause();
            json!({ "ok": true })
        }
        Command::Stop => {
            control.stop();
            json!({ "ok": true })
        }
        Command::Seek { frame } => json!({ "ok": true, "frame": control.seek(frame) }),
        Command::Skip { frame } => json!({ "ok": true, "frame": control.skip_to_frame(frame) }),
        Command::StepBack => json!({ "ok": true, "frame": control.step_backward() }),
        Command::Channel { channel, enabled } => {
            match control.set_audio_channel_enabled(channel, enabled) {
                Ok(()) => json!({ "ok": true }),
                Err(e) => json!({ "ok": false, "error": e.to_string() }),
            }
        }
        Command::Volume { volume } => {
            control.set_volume(volume);
            json!({ "ok": true, "volume": control.volume() })
        }
        Command::EndFrame { frame } => {
            control.set_end_frame(frame);
            json!({ "ok": true })
        }
        Command::Frame => json!({
            "frame": control.get_current_frame(),
            "state": control.state(),
        }),
        Command::Info => json!({
            "video_width": control.get_video_width(),
            "video_height": control.get_video_height(),
            "content_width": control.get_content_width(),
            "content_height": control.get_content_height(),
            "total_frames": control.total_frames(),
            "geometry": engine.geometry(),
        }),
        Command::Stats => serde_json::to_value(engine.stats()).unwrap_or(Value::Null),
        Command::Quit => return None,
    };
    Some(reply)
}

/// Read JSON lines from stdin into `inbox` until EOF.
fn spawn_stdin_reader(inbox: Arc<Mutex<VecDeque<String>>>, closed: Arc<AtomicBool>) -> Result<()> {
    thread::Builder::new()
        .name("dcmv-stdin".into())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => inbox.lock().push_back(line),
                    Err(e) => {
                        tracing::error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
            closed.store(true, Ordering::Release);
        })?;
    Ok(())
}

fn emit(out: &mut impl Write, value: &Value) {
    if writeln!(out, "{}", value).and_then(|_| out.flush()).is_err() {
        tracing::warn!("stdout closed, dropping reply");
    }
}

// ============================================================================
// Audio
// ============================================================================

/// Pull audio at the stream rate, standing in for a device callback.
fn spawn_mixer(
    audio: Arc<AudioStreamSource>,
    sample_rate: u32,
    bits_per_sample: u32,
    running: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    let samples = (u128::from(sample_rate) * MIX_INTERVAL.as_millis() / 1000) as usize;
    let chunk = (samples * bits_per_sample as usize / 8).max(1);
    let handle = thread::Builder::new()
        .name("dcmv-mixer".into())
        .spawn(move || {
            let mut left = vec![0u8; chunk];
            let mut right = vec![0u8; chunk];
            while running.load(Ordering::Acquire) {
                audio.fill(&mut left, &mut right);
                thread::sleep(MIX_INTERVAL);
            }
        })?;
    Ok(handle)
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dcmv=info".parse()?)
                .add_directive("dcmv_core=info".parse()?),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    let config = match &options.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let bits_per_sample = config.audio_bits_per_sample;

    tracing::info!("DCMV Player v{}", dcmv_core::VERSION);
    let mut engine = Engine::open(Arc::new(FileSource::new(&options.input)), config)?;
    let mut stdout = io::stdout();

    if options.info_only {
        emit(&mut stdout, &serde_json::to_value(engine.header())?);
        return Ok(());
    }

    let header = engine.header();
    tracing::info!(
        "{}x{} ({}x{} visible) at {}, {} unique / {} total frames",
        header.width,
        header.height,
        header.content_width,
        header.content_height,
        header.timebase,
        header.unique_frames,
        header.total_frames
    );

    let running = Arc::new(AtomicBool::new(true));
    let mixer = spawn_mixer(
        engine.audio(),
        u32::from(header.sample_rate),
        bits_per_sample,
        running.clone(),
    )?;

    let inbox = Arc::new(Mutex::new(VecDeque::new()));
    let stdin_closed = Arc::new(AtomicBool::new(false));
    spawn_stdin_reader(inbox.clone(), stdin_closed.clone())?;

    let control = engine.control();
    let mut sink = NullSink::default();
    let mut announced_end = false;

    'ticks: loop {
        let pending: Vec<String> = inbox.lock().drain(..).collect();
        for line in pending {
            match serde_json::from_str::<Command>(&line) {
                Ok(command) => {
                    tracing::debug!("Command: {:?}", command);
                    match apply(command, &engine, &control) {
                        Some(reply) => emit(&mut stdout, &reply),
                        None => break 'ticks,
                    }
                }
                Err(e) => emit(&mut stdout, &json!({ "ok": false, "error": e.to_string() })),
            }
        }

        engine.tick(&mut sink);

        let ended = control.state() == PlaybackState::Ended;
        if ended && !announced_end {
            emit(&mut stdout, &json!({ "event": "ended", "frame": control.get_current_frame() }));
        }
        announced_end = ended;
        if ended && (options.exit_at_end || stdin_closed.load(Ordering::Acquire)) {
            break;
        }

        thread::sleep(TICK_INTERVAL);
    }

    running.store(false, Ordering::Release);
    engine.shutdown();
    if mixer.join().is_err() {
        tracing::error!("Mixer thread panicked");
    }

    let stats = engine.stats();
    tracing::info!(
        "Playback finished: displayed={}, uploads={}, decode_failures={}, recoveries={}",
        stats.displayed,
        sink.uploads,
        stats.decode_failures,
        stats.recoveries
    );
    Ok(())
}
