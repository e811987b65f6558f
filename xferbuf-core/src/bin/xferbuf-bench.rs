//! Push silence through a buffer process and report throughput.
//!
//! ```text
//! cargo run -p xferbuf-core --bin xferbuf-bench -- --seconds 10 --realtime
//! ```

use std::path::PathBuf;
use std::time::Instant;

use serde::Serialize;
use tracing::info;
use xferbuf::{
    AudioFormat, BufferConfig, BufferController, Encoding, NullSinkFactory, SpawnMode,
};

#[derive(Debug)]
struct Args {
    seconds: f64,
    rate: u32,
    channels: u16,
    buffer_bytes: Option<usize>,
    thread: bool,
    realtime: bool,
    config: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct Summary {
    mode: SpawnMode,
    format: String,
    capacity: usize,
    output_burst: usize,
    bytes_written: u64,
    audio_seconds: f64,
    wall_ms: f64,
    realtime_factor: f64,
    mib_per_second: f64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("xferbuf=info")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("xferbuf-bench failed: {e}");
        std::process::exit(1);
    }
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        seconds: 5.0,
        rate: 44_100,
        channels: 2,
        buffer_bytes: None,
        thread: false,
        realtime: false,
        config: None,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().ok_or(format!("missing value for {name}"));
        match arg.as_str() {
            "--seconds" => {
                args.seconds = value("--seconds")?
                    .parse::<f64>()
                    .map_err(|_| "invalid value for --seconds".to_string())?
                    .clamp(0.1, 3600.0);
            }
            "--rate" => {
                args.rate = value("--rate")?
                    .parse()
                    .map_err(|_| "invalid value for --rate".to_string())?;
            }
            "--channels" => {
                args.channels = value("--channels")?
                    .parse()
                    .map_err(|_| "invalid value for --channels".to_string())?;
            }
            "--buffer-bytes" => {
                args.buffer_bytes = Some(
                    value("--buffer-bytes")?
                        .parse()
                        .map_err(|_| "invalid value for --buffer-bytes".to_string())?,
                );
            }
            "--config" => args.config = Some(PathBuf::from(value("--config")?)),
            "--thread" => args.thread = true,
            "--realtime" => args.realtime = true,
            "--help" | "-h" => {
                println!(
                    "Usage: xferbuf-bench [--seconds <s>] [--rate <hz>] [--channels <n>] \\
  [--buffer-bytes <n>] [--thread] [--realtime] [--config <file.json>]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    if args.rate == 0 || args.channels == 0 {
        return Err("rate and channels must be positive".into());
    }
    Ok(args)
}

fn run() -> Result<(), String> {
    let args = parse_args()?;

    let mut config = match &args.config {
        Some(path) => BufferConfig::load(path).map_err(|e| e.to_string())?,
        None => BufferConfig::default(),
    };
    if let Some(bytes) = args.buffer_bytes {
        config.buffer_bytes = bytes;
    }
    if args.thread {
        config.spawn_mode = SpawnMode::Thread;
    }
    let mode = config.spawn_mode;

    let factory = NullSinkFactory::new().realtime(args.realtime);
    let mut ctl = BufferController::launch(config, factory).map_err(|e| e.to_string())?;

    let format = AudioFormat::new(args.rate, args.channels, Encoding::SIGNED_16);
    let opened = ctl.open(None, None).map_err(|e| e.to_string())?;
    info!(driver = ?opened.driver, %format, seconds = args.seconds, "benchmark starting");
    ctl.start(format).map_err(|e| e.to_string())?;

    let total = (args.seconds * format.byte_rate() as f64) as u64;
    let block = vec![0u8; format.frame_size() * 1024];
    let started = Instant::now();
    let mut written = 0u64;
    while written < total {
        let want = (total - written).min(block.len() as u64) as usize;
        let n = ctl.write(&block[..want]).map_err(|e| e.to_string())?;
        if n == 0 {
            break;
        }
        written += n as u64;
    }
    ctl.drain().map_err(|e| e.to_string())?;
    let wall = started.elapsed();

    let summary = Summary {
        mode,
        format: format.to_string(),
        capacity: ctl.capacity(),
        output_burst: ctl.config().output_burst,
        bytes_written: written,
        audio_seconds: written as f64 / format.byte_rate().max(1) as f64,
        wall_ms: wall.as_secs_f64() * 1000.0,
        realtime_factor: written as f64
            / format.byte_rate().max(1) as f64
            / wall.as_secs_f64().max(f64::EPSILON),
        mib_per_second: written as f64 / (1024.0 * 1024.0) / wall.as_secs_f64().max(f64::EPSILON),
    };

    ctl.close().map_err(|e| e.to_string())?;
    ctl.shutdown().map_err(|e| e.to_string())?;

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}
