//! rtperf CLI - The `rtperf` command.
//!
//! Drives the reference engine through the full control protocol:
//!
//! - `play` runs a realtime performance on the software render thread
//! - `render` runs an offline render and fetches the result from the
//!   engine's file system
//! - `ops` lists the engine operation table
//! - `config` manages the configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use rtperf_core::{
    Config, EventKind, NullCoordinator, Performance, RenderThread, SineEngine, Value,
};
use std::fs::{self, File};
use std::io::{BufWriter, Cursor};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Name of the offline render target inside the engine's file system.
const RENDER_TARGET: &str = "render.wav";

type WavFileWriter = hound::WavWriter<BufWriter<File>>;

/// rtperf - drive a realtime synthesis engine from a control thread
#[derive(Parser, Debug)]
#[command(name = "rtperf")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run and render performances against the reference engine", long_about = None)]
struct Args {
    /// Configuration file (defaults to the platform config location)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a realtime performance (Ctrl+C stops it)
    Play {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<f64>,

        /// Oscillator frequency in Hz
        #[arg(short, long)]
        frequency: Option<f64>,

        /// Capture the rendered output to a WAV file
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Render offline to a WAV file
    Render {
        /// Length of the render in seconds
        #[arg(short, long)]
        duration: f64,

        /// Output WAV file
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Oscillator frequency in Hz
        #[arg(short, long)]
        frequency: Option<f64>,
    },

    /// List the engine operations
    Ops,

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write a commented default config file
    Init,
    /// Print the config file location
    Path,
    /// Print the effective configuration
    Show,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    match args.command {
        Commands::Play {
            duration,
            frequency,
            output,
        } => {
            let config = load_config(args.config.as_deref())?;
            play(&config, duration, frequency, output)
        }
        Commands::Render {
            duration,
            output,
            frequency,
        } => {
            let config = load_config(args.config.as_deref())?;
            render(&config, duration, frequency, &output)
        }
        Commands::Ops => {
            list_operations();
            Ok(())
        }
        Commands::Config { action } => manage_config(action, args.config.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(Config::load_or_default()),
    }
}

/// Register a Ctrl+C flag.
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag.clone())
        .context("Failed to install Ctrl+C handler")?;
    Ok(flag)
}

/// Channel that fires once when `kind` is emitted.
fn subscribe(perf: &Performance, kind: EventKind) -> Receiver<()> {
    let (tx, rx) = unbounded();
    perf.events().add_listener(kind, move |_| {
        let _ = tx.send(());
    });
    rx
}

/// Block until `ended` fires, stopping the performance on Ctrl+C.
fn wait_for_end(perf: &Performance, ended: &Receiver<()>, interrupted: &AtomicBool) -> Result<()> {
    loop {
        if interrupted.load(Ordering::Relaxed) {
            log::info!("Interrupted, stopping performance");
            perf.stop()?;
            return Ok(());
        }
        if ended.recv_timeout(Duration::from_millis(100)).is_ok() {
            return Ok(());
        }
    }
}

fn play(
    config: &Config,
    duration: Option<f64>,
    frequency: Option<f64>,
    output: Option<PathBuf>,
) -> Result<()> {
    let channels = config.engine.nchnls as u16;
    let writer: Arc<Mutex<Option<WavFileWriter>>> = Arc::new(Mutex::new(None));
    if let Some(path) = &output {
        let spec = hound::WavSpec {
            channels,
            sample_rate: config.engine.sample_rate as u32,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let wav = hound::WavWriter::create(path, spec)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        *writer.lock() = Some(wav);
    }

    let sink = writer.clone();
    let render = RenderThread::new(&config.render).with_output(move |block, _channels| {
        if let Some(wav) = sink.lock().as_mut() {
            for sample in block {
                if wav.write_sample(*sample as f32).is_err() {
                    break;
                }
            }
        }
    });
    let cycles = render.cycle_counter();

    let perf = Performance::initialize(SineEngine::factory(), config, Box::new(render))?;
    if let Some(frequency) = frequency {
        perf.set_control_channel("freq", frequency)?;
    }
    if let Some(duration) = duration {
        perf.set_option(&format!("--duration={}", duration))?;
    }

    let ended = subscribe(&perf, EventKind::RealtimePerformanceEnded);
    let interrupted = interrupt_flag()?;

    let status = perf.start()?;
    if status != 0 {
        anyhow::bail!("Engine failed to start (status {})", status);
    }
    log::info!("Playing (Press Ctrl+C to stop)");
    wait_for_end(&perf, &ended, &interrupted)?;
    drop(perf);

    log::info!("Rendered {} cycles", cycles.load(Ordering::Relaxed));
    if let Some(wav) = writer.lock().take() {
        wav.finalize().context("Failed to finalize WAV capture")?;
        if let Some(path) = &output {
            log::info!("Captured output to {}", path.display());
        }
    }
    Ok(())
}

fn render(config: &Config, duration: f64, frequency: Option<f64>, output: &Path) -> Result<()> {
    let perf = Performance::initialize(SineEngine::factory(), config, Box::new(NullCoordinator))?;
    perf.set_option(&format!("-o{}", RENDER_TARGET))?;
    perf.set_option(&format!("--duration={}", duration))?;
    if let Some(frequency) = frequency {
        perf.set_control_channel("freq", frequency)?;
    }

    let ended = subscribe(&perf, EventKind::RenderEnded);
    let interrupted = interrupt_flag()?;

    log::info!("Rendering {:.2}s to {}", duration, output.display());
    let status = perf.start()?;
    if status != 0 {
        anyhow::bail!("Engine failed to start (status {})", status);
    }
    wait_for_end(&perf, &ended, &interrupted)?;

    let bytes = match perf.read_from_fs(RENDER_TARGET)? {
        Some(Value::Bytes(bytes)) => bytes,
        other => anyhow::bail!("Unexpected render result: {:?}", other),
    };
    let reader = hound::WavReader::new(Cursor::new(bytes.as_slice()))
        .context("Render output is not a WAV file")?;
    let spec = reader.spec();
    log::info!(
        "Rendered {} frames ({} channels @ {} Hz)",
        reader.duration(),
        spec.channels,
        spec.sample_rate
    );

    fs::write(output, &bytes).with_context(|| format!("Failed to write {}", output.display()))?;
    log::info!("Wrote {}", output.display());
    Ok(())
}

fn list_operations() {
    let table = rtperf_core::OperationTable::build();
    println!("{:<24} {:<8} PARAMETERS", "OPERATION", "DISPATCH");
    for op in table.iter() {
        println!(
            "{:<24} {:<8} {}",
            op.name(),
            format!("{:?}", op.dispatch()).to_lowercase(),
            op.params().join(", ")
        );
    }
    println!();
    println!("Lifecycle: start, stop, reset, pause, resume");
}

fn manage_config(action: ConfigAction, path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Init => {
            let path = Config::create_default_config_file()?;
            println!("Created {}", path.display());
        }
        ConfigAction::Path => {
            println!("{}", Config::config_path()?.display());
        }
        ConfigAction::Show => {
            let config = load_config(path)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
