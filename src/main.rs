use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use railprobe_lib::constants::ACQUIRE_POLL_TICK;
use railprobe_lib::ports::is_excluded;
use railprobe_lib::transport::mock::{MockBackend, MockDevice, SimulatedFirmware};
use railprobe_lib::{
    AutoDetector, CHANNELS, CancelFlag, ConnectResult, DetectOutcome, DetectionEvent, DetectorConfig, DeviceRole,
    Handshake, MemorySampleStore, ModeScanner, PortBackend, SampleStore, ScanEvent, SystemPorts, Transport,
};

/// Port name the simulated fixture is published under
const SIMULATED_PORT: &str = "sim0";

/// Reading the simulated fixture reports on every channel
const SIMULATED_READING: i32 = 500;

/// Exit code of a detection run that produced a FAIL verdict
const EXIT_FAIL: i32 = 2;

/// Host-side tool for the two-role power-rail test fixture.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports the fixture may be attached to.
    Ports {
        /// Also show ports owned by debug adapters.
        #[arg(short, long)]
        all: bool,
    },
    /// Probe every port until one of the firmware roles answers.
    Scan,
    /// Run the auto-detection workflow and print the verdict.
    Detect {
        /// Detector configuration file (JSON).
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Port to try first.
        #[arg(short, long)]
        port: Option<String>,
        /// Run against a simulated fixture instead of real hardware.
        #[arg(long)]
        simulate: bool,
    },
    /// Connect to the monitor firmware and print every channel each cycle.
    Monitor {
        /// Port to connect to; all candidates are tried when omitted.
        #[arg(short, long)]
        port: Option<String>,
        /// Pause between sweeps in milliseconds.
        #[arg(short, long, default_value_t = 1000)]
        interval_ms: u64,
        /// Run against a simulated fixture instead of real hardware.
        #[arg(long)]
        simulate: bool,
    },
    /// Write the default detector configuration to a file.
    InitConfig { path: PathBuf },
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, -v for DEBUG, RUST_LOG wins over both
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

/// Set `cancel` on the first Ctrl+C
fn cancel_on_ctrl_c(cancel: CancelFlag) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping");
            cancel.cancel();
        }
    });
}

/// One in-process fixture answering as `role`
fn simulated_backend(role: DeviceRole) -> Arc<dyn PortBackend> {
    let device = MockDevice::new(SimulatedFirmware::uniform(role, SIMULATED_READING))
        .with_banner("boot: rail fixture simulator\r\n");
    Arc::new(MockBackend::new().with_device(SIMULATED_PORT, None, device))
}

fn backend(simulate: bool, role: DeviceRole) -> Arc<dyn PortBackend> {
    if simulate {
        info!(port = SIMULATED_PORT, %role, "Using simulated fixture");
        simulated_backend(role)
    } else {
        Arc::new(SystemPorts)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let guard = setup_logging(cli.log_file, &cli.verbose)?;

    let result = match cli.command {
        Command::Ports { all } => list_ports(all),
        Command::Scan => scan().await,
        Command::Detect { config, port, simulate } => detect(config, port, simulate).await,
        Command::Monitor {
            port,
            interval_ms,
            simulate,
        } => monitor(port, Duration::from_millis(interval_ms), simulate).await,
        Command::InitConfig { path } => init_config(path),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };

    // Flush the file log before exiting
    drop(guard);
    if code != 0 {
        process::exit(code);
    }
    Ok(())
}

fn list_ports(all: bool) -> Result<i32> {
    let excluded = DetectorConfig::default().excluded_vids;
    let ports = SystemPorts.available_ports().context("Failed to enumerate serial ports")?;

    let mut shown = 0;
    for port in &ports {
        let skip = is_excluded(port, &excluded);
        if skip && !all {
            continue;
        }
        shown += 1;
        let vid = port.vid.map_or_else(|| "----".to_string(), |v| format!("{:04x}", v));
        let product = port.product.as_deref().unwrap_or("");
        let marker = if skip { "  (debug adapter, excluded)" } else { "" };
        println!("{:<24} vid {}  {}{}", port.name, vid, product, marker);
    }
    if shown == 0 {
        println!("No serial ports found.");
    }
    Ok(0)
}

async fn scan() -> Result<i32> {
    let cancel = CancelFlag::new();
    cancel_on_ctrl_c(cancel.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let excluded = DetectorConfig::default().excluded_vids;
    let scanner = ModeScanner::new(Arc::new(SystemPorts), excluded, tx, cancel);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ScanEvent::NoPort => println!("No serial port detected, retrying..."),
                ScanEvent::Probing { port } => println!("Probing {}...", port),
                ScanEvent::NotFound => println!("No firmware answered, retrying..."),
                ScanEvent::Found { port, role } => println!("Found {} firmware on {}", role, port),
            }
        }
    });

    let found = scanner.run().await;
    drop(scanner);
    let _ = printer.await;

    match found {
        Some((port, role)) => {
            info!(%port, %role, "Scan complete");
            Ok(0)
        }
        None => {
            println!("Scan cancelled.");
            Ok(1)
        }
    }
}

async fn detect(config_path: Option<PathBuf>, port: Option<String>, simulate: bool) -> Result<i32> {
    let config = match config_path {
        Some(path) => DetectorConfig::load(&path).with_context(|| format!("Failed to load config {:?}", path))?,
        None => DetectorConfig::default(),
    };
    debug!(?config, "Detector configuration");

    let preferred = port.or_else(|| config.preferred_port.clone());
    let excluded = config.excluded_vids.clone();
    let store = Arc::new(MemorySampleStore::new());
    let transport = Transport::new(DeviceRole::Detector, backend(simulate, DeviceRole::Detector), store);

    let cancel = CancelFlag::new();
    cancel_on_ctrl_c(cancel.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut detector = AutoDetector::new(transport, Arc::new(config), tx, cancel)
        .with_port_filter(excluded)
        .with_preferred_port(preferred);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                DetectionEvent::StateChanged(state) => debug!(%state, "State"),
                DetectionEvent::Reading(channel) => debug!(%channel, "Requesting channel"),
                DetectionEvent::Progress { status, fraction } => {
                    info!("[{:>3.0}%] {}", fraction * 100.0, status)
                }
                DetectionEvent::Notice(message) => println!("{}", message),
                DetectionEvent::Verdict(_) => {}
            }
        }
    });

    let outcome = detector.start().await;
    detector.disconnect();
    drop(detector);
    let _ = printer.await;

    match outcome {
        DetectOutcome::Completed(verdict) => {
            println!("Result: {}", verdict);
            for item in verdict.descriptions() {
                println!("  - {}", item);
            }
            Ok(if verdict.passed { 0 } else { EXIT_FAIL })
        }
        DetectOutcome::Cancelled => Ok(1),
        DetectOutcome::Aborted(e) => Err(e).context("Auto-detection aborted"),
    }
}

async fn monitor(port: Option<String>, interval: Duration, simulate: bool) -> Result<i32> {
    let role = DeviceRole::Monitor;
    let store = Arc::new(MemorySampleStore::new());
    let mut transport = Transport::new(role, backend(simulate, role), store.clone());

    let cancel = CancelFlag::new();
    cancel_on_ctrl_c(cancel.clone());

    let candidates = match port {
        Some(port) => vec![port],
        None => transport.candidate_ports(&DetectorConfig::default().excluded_vids)?,
    };
    if candidates.is_empty() {
        bail!("No serial port detected");
    }

    let handshake = Handshake::default();
    let mut connected = None;
    for name in &candidates {
        if cancel.is_cancelled() {
            return Ok(1);
        }
        match handshake.connect_and_verify(&mut transport, name).await {
            ConnectResult::Success => {
                connected = Some(name.clone());
                break;
            }
            result => warn!(port = %name, %result, "Not a monitor fixture"),
        }
    }
    let Some(port) = connected else {
        bail!("No monitor firmware answered on {} port(s)", candidates.len());
    };
    println!("Monitoring {} (Ctrl+C to stop)", port);

    let mut cycle = 0u64;
    while !cancel.is_cancelled() {
        cycle += 1;
        for channel in CHANNELS.iter() {
            if !transport.send(channel.command) {
                break;
            }
            transport.idle(ACQUIRE_POLL_TICK).await;
        }
        if !transport.is_open() {
            bail!("Link to {} lost ({})", port, transport.status());
        }

        println!("--- cycle {} ---", cycle);
        for channel in CHANNELS.iter() {
            match store.latest_sample(channel.id) {
                Some(sample) => println!("{:>2} {:<16} {:>6}", channel.id.0, channel.display_name, sample.value),
                None => println!("{:>2} {:<16} {:>6}", channel.id.0, channel.display_name, "--"),
            }
        }

        // Heartbeat keeps running between sweeps
        let mut waited = Duration::ZERO;
        while waited < interval && !cancel.is_cancelled() && transport.is_open() {
            transport.idle(ACQUIRE_POLL_TICK).await;
            waited += ACQUIRE_POLL_TICK;
        }
        debug!(cycle, status = %transport.status(), "Cycle finished");
    }

    transport.close();
    Ok(0)
}

fn init_config(path: PathBuf) -> Result<i32> {
    DetectorConfig::default()
        .save(&path)
        .with_context(|| format!("Failed to write config to {:?}", path))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(0)
}
