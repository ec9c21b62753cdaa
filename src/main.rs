//! Webcamize CLI
//!
//! Orchestration only: argument parsing, logging setup, the elevation
//! decision, and driving the streaming session on its own thread. All
//! diagnostics go to stderr; stdout stays free for frame data.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use webcamize::config::{ConfigFile, OutputTarget, StreamConfig};
use webcamize::output::Sink;
use webcamize::pump::{CancelToken, FramePump, PumpOptions, Session, Stats};
use webcamize::{camera, convert::Converter, elevate, output};

/// Bounded restart policy for --persist
const RESTART_LIMIT: u32 = 5;
const RESTART_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "webcamize")]
#[command(about = "Use (almost) any camera as a virtual webcam")]
#[command(version)]
struct Cli {
    /// gphoto2 camera model to use; autodetects by default
    #[arg(short, long)]
    camera: Option<String>,

    /// /dev/videoN device number to use
    #[arg(short, long)]
    device: Option<u32>,

    /// Stream frames to a file instead of a video device ("-" for stdout)
    #[arg(short, long)]
    output: Option<String>,

    /// Target frame rate
    #[arg(short, long)]
    fps: Option<u32>,

    /// Write raw preview payloads without decoding
    #[arg(long)]
    no_convert: bool,

    /// Use a pre-existing loopback device instead of creating one
    #[arg(long)]
    no_alloc: bool,

    /// Wait up to this many seconds for a camera to appear
    #[arg(short, long, default_value_t = 0)]
    wait: u64,

    /// Restart the stream after runtime failures (bounded)
    #[arg(long)]
    persist: bool,

    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Disable colored log output
    #[arg(long)]
    no_color: bool,

    /// Print a status report and quit
    #[arg(short, long)]
    status: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("webcamize={}", cli.log_level).parse()?),
        )
        .with_ansi(!cli.no_color)
        .with_writer(std::io::stderr)
        .init();

    if cli.status {
        return cmd_status();
    }

    let config = build_config(&cli);

    // Elevation hand-off happens before any camera or device state exists;
    // on success the child did the entire run.
    if matches!(config.output, OutputTarget::Device)
        && config.self_alloc
        && elevate::needs_elevation()
    {
        let code = elevate::reexec_elevated()?;
        std::process::exit(code);
    }

    let cancel = CancelToken::new();
    let mut attempts_left = if cli.persist { RESTART_LIMIT } else { 1 };

    loop {
        match run_stream(config.clone(), cancel.clone()).await {
            Ok(_stats) => return Ok(()),
            Err(e) => {
                attempts_left = attempts_left.saturating_sub(1);
                if attempts_left == 0 || cancel.is_cancelled() {
                    return Err(e);
                }
                warn!(
                    "Stream failed ({}), restarting in {}s ({} attempts left)",
                    e,
                    RESTART_DELAY.as_secs(),
                    attempts_left
                );
                tokio::time::sleep(RESTART_DELAY).await;
            }
        }
    }
}

/// Merge defaults, config file, and CLI flags (CLI wins).
fn build_config(cli: &Cli) -> StreamConfig {
    let mut config = StreamConfig::default();

    let path = cli.config.clone().unwrap_or_else(ConfigFile::default_path);
    match ConfigFile::load_from(&path) {
        Ok(file) => file.apply_to(&mut config),
        Err(e) => warn!("Ignoring config file: {}", e),
    }

    if cli.camera.is_some() {
        config.camera = cli.camera.clone();
    }
    if cli.device.is_some() {
        config.device = cli.device;
    }
    if let Some(output) = &cli.output {
        config.output = OutputTarget::from_arg(output);
    }
    if let Some(fps) = cli.fps {
        config.fps = fps;
    }
    if cli.no_convert {
        config.convert = false;
    }
    if cli.no_alloc {
        config.self_alloc = false;
    }
    config.wait_secs = cli.wait;

    config
}

/// One streaming attempt: pump thread plus the Ctrl-C watcher.
async fn run_stream(config: StreamConfig, cancel: CancelToken) -> anyhow::Result<Stats> {
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let thread_cancel = cancel.clone();

    // Camera and decoder state is thread-affine; build everything inside
    // the pump thread and only ship the result back.
    let handle = std::thread::spawn(move || {
        let result = stream_thread(config, thread_cancel);
        let _ = done_tx.send(result);
    });

    let mut done_rx = done_rx;
    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, finishing current cycle");
            cancel.cancel();
            done_rx.await
        }
        result = &mut done_rx => result,
    };
    let _ = handle.join();

    match outcome {
        Ok(result) => Ok(result?),
        Err(_) => Err(anyhow::anyhow!("Pump thread terminated unexpectedly")),
    }
}

/// The synchronous streaming run: bind, provision, pump, teardown.
fn stream_thread(config: StreamConfig, cancel: CancelToken) -> webcamize::Result<Stats> {
    let camera = camera::bind(config.camera.as_deref(), config.wait_secs)?;
    let sink = output::create_sink(&config, Some(camera.model()))?;

    if !config.convert && matches!(sink, Sink::Loopback(_)) {
        warn!("Conversion disabled: the device format will not be negotiated");
    }

    let converter = Converter::new()?;
    let mut session = Session::new(camera, converter, sink);
    let pump = FramePump::new(
        PumpOptions { period: config.period(), convert: config.convert },
        cancel,
    );

    let result = pump.run(&mut session);
    // Teardown runs on both graceful stop and fatal runtime errors; its own
    // failures are logged and never change the exit status.
    session.sink.teardown();
    result
}

/// Print a status report: detected cameras, output nodes, elevation state.
fn cmd_status() -> anyhow::Result<()> {
    println!("webcamize {}", webcamize::VERSION);
    println!();

    match camera::detect() {
        Ok(cameras) if cameras.is_empty() => println!("Cameras: none detected"),
        Ok(cameras) => {
            println!("Cameras:");
            for (model, port) in cameras {
                println!("  {} ({})", model, port);
            }
        }
        Err(e) => println!("Cameras: enumeration failed ({})", e),
    }

    println!();
    let nodes = output::discover_output_nodes();
    if nodes.is_empty() {
        println!("Output nodes: none present");
    } else {
        println!("Output nodes:");
        for (path, card) in nodes {
            println!("  {} (\"{}\")", path.display(), card);
        }
    }

    println!();
    println!(
        "Loopback control: {}",
        if std::path::Path::new("/dev/v4l2loopback").exists() {
            "available"
        } else {
            "not present (module not loaded)"
        }
    );
    println!(
        "Elevation: {}",
        if elevate::needs_elevation() {
            "required for self-allocation (pkexec)"
        } else {
            "not required"
        }
    );

    Ok(())
}
