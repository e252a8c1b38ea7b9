use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use gonio_lib::{
    CloseReason, Command, DecodeMode, DeviceConfig, EventSink, FnSink, JogDirection, Session, SessionConfig,
    SessionEvent, TelemetrySample,
};
use gonio_rs::console::{self, ConsoleAction};
use gonio_rs::logging::setup_logging;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Operator console for a two-axis goniometer over TCP.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON file with session settings (host, port, timeouts, decode mode).
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Device host, overrides the config file.
    #[arg(long)]
    host: Option<String>,
    /// Device port, overrides the config file.
    #[arg(short, long)]
    port: Option<u16>,
    /// Reject telemetry with a coordinate above this value and drop the connection.
    #[arg(long, value_name = "MAX_COORDINATE")]
    strict: Option<u32>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print position telemetry until Ctrl+C or the device disconnects.
    Monitor {
        /// Exit after this many samples.
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
    /// Move to an absolute position.
    Goto {
        #[arg(allow_hyphen_values = true)]
        x: f64,
        #[arg(allow_hyphen_values = true)]
        y: f64,
    },
    /// Move to 0, 0.
    Home,
    /// Jog in one direction for a while, then stop.
    Jog {
        direction: JogDirection,
        #[arg(long, default_value_t = 500)]
        hold_ms: u64,
    },
    /// Analog jog with a normalized vector for a while, then stop.
    Joy {
        #[arg(allow_hyphen_values = true)]
        x: f64,
        #[arg(allow_hyphen_values = true)]
        y: f64,
        #[arg(long, default_value_t = 500)]
        hold_ms: u64,
    },
    /// Stop any motion.
    Stop,
    /// Run a polynomial trajectory (five coefficients per axis, comma separated).
    Trajectory {
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true, required = true)]
        x: Vec<f64>,
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true, required = true)]
        y: Vec<f64>,
    },
    /// Push PID gains, speed limits and tolerances.
    Config {
        /// JSON preset with the ten fields of a device config.
        #[arg(long, conflicts_with = "values")]
        preset: Option<PathBuf>,
        /// P_X I_X D_X P_Y I_Y D_Y MAX_X MAX_Y TOL_X TOL_Y
        #[arg(num_args = 10, allow_hyphen_values = true)]
        values: Vec<f64>,
    },
    /// Interactive console: type commands while telemetry is printed.
    Console,
}

fn session_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path).with_context(|| format!("Failed to load config {:?}", path))?,
        None => SessionConfig::default(),
    };
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(max_coordinate) = cli.strict {
        config.decode_mode = DecodeMode::Strict { max_coordinate };
    }
    Ok(config)
}

fn load_preset(path: &PathBuf) -> Result<DeviceConfig> {
    let txt = std::fs::read_to_string(path).with_context(|| format!("Failed to read preset {:?}", path))?;
    serde_json::from_str(&txt).with_context(|| format!("Invalid preset {:?}", path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.as_deref(), &cli.verbose)?;

    let config = session_config(&cli)?;
    let session = Session::new(config);

    tokio::select! {
        res = run(&session, cli.command) => {
            if let Err(e) = res {
                error!("{:#}", e);
                session.stop().await;
                process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down gracefully.");
        }
    }
    session.stop().await;
    Ok(())
}

async fn connect<S: EventSink>(session: &Session, sink: S) -> Result<()> {
    session
        .start_default(sink)
        .await
        .context("Could not reach the goniometer")
}

async fn run(session: &Session, command: Cmd) -> Result<()> {
    // The console prints events straight from the receive task.
    if let Cmd::Console = command {
        return interactive(session).await;
    }
    let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
    connect(session, tx).await?;

    match command {
        Cmd::Monitor { count } => monitor(&mut rx, count).await,
        Cmd::Goto { x, y } => send(session, Command::Goto { x, y }).await,
        Cmd::Home => send(session, Command::home()).await,
        Cmd::Jog { direction, hold_ms } => hold(session, Command::Jog(direction), hold_ms).await,
        Cmd::Joy { x, y, hold_ms } => {
            let command = Command::AnalogJog {
                x: console::clamp_unit(x),
                y: console::clamp_unit(y),
            };
            hold(session, command, hold_ms).await
        }
        Cmd::Stop => send(session, Command::Stop).await,
        Cmd::Trajectory { x, y } => send(session, Command::trajectory(&x, &y)?).await,
        Cmd::Config { preset, values } => {
            let config = match preset {
                Some(path) => load_preset(&path)?,
                None => {
                    let values: [f64; 10] = values
                        .try_into()
                        .map_err(|v: Vec<f64>| anyhow::anyhow!("config needs 10 values, got {}", v.len()))?;
                    DeviceConfig::from_wire(values)
                }
            };
            send(session, Command::ConfigSet(config)).await?;
            info!("Configuration sent");
            Ok(())
        }
        Cmd::Console => Ok(()), // handled before connecting
    }
}

async fn send(session: &Session, command: Command) -> Result<()> {
    session
        .send_command(&command)
        .await
        .with_context(|| format!("Failed to send {:?}", command))
}

/// Press-and-release: start the motion, wait, then stop it.
async fn hold(session: &Session, command: Command, hold_ms: u64) -> Result<()> {
    send(session, command).await?;
    tokio::time::sleep(Duration::from_millis(hold_ms)).await;
    send(session, Command::Stop).await
}

fn print_sample(sample: TelemetrySample) {
    println!("x={:>10} y={:>10}", sample.x, sample.y);
}

fn report_close(reason: &CloseReason) {
    if *reason != CloseReason::LocalStop {
        warn!(?reason, "Connection closed");
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Sample(sample) => print_sample(*sample),
        SessionEvent::Closed(reason) => report_close(reason),
    }
}

async fn monitor(rx: &mut mpsc::UnboundedReceiver<SessionEvent>, count: Option<usize>) -> Result<()> {
    let mut seen = 0usize;
    while let Some(event) = rx.recv().await {
        print_event(&event);
        match event {
            SessionEvent::Sample(_) => {
                seen += 1;
                if count.is_some_and(|n| seen >= n) {
                    break;
                }
            }
            SessionEvent::Closed(_) => break,
        }
    }
    info!(samples = seen, "Monitor finished");
    Ok(())
}

async fn interactive(session: &Session) -> Result<()> {
    connect(session, FnSink::new(print_sample, |reason: CloseReason| report_close(&reason))).await?;
    println!("{}", console::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match console::parse_line(&line) {
            Ok(ConsoleAction::Send(command)) => {
                if let Err(e) = session.send_command(&command).await {
                    warn!("{}", e);
                }
            }
            Ok(ConsoleAction::Status) => println!("session: {}", session.state()),
            Ok(ConsoleAction::Help) => println!("{}", console::HELP),
            Ok(ConsoleAction::Quit) => break,
            Ok(ConsoleAction::Nothing) => {}
            Err(e) => println!("error: {:#}", e),
        }
    }

    session.stop().await;
    Ok(())
}
